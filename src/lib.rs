//! A TFTP (RFC 1350) daemon on a single UDP socket, with negotiated
//!  options (RFC 2347), block size (RFC 2348), and timeout / transfer size
//!  (RFC 2349).
//!
//! ## Design
//!
//! * One listening socket serves every transfer; the peer's endpoint
//!   (IP + UDP port) is the sole key of the connection table. Classic TFTP
//!   moves each transfer to an ephemeral server port instead - this daemon
//!   intentionally does not, so a client restarting a transfer from the
//!   same port supersedes its live connection.
//! * Each connection is a lock-step state machine: it sequences block
//!   numbers, pumps payload between the shared socket and an
//!   application-supplied byte source or sink, answers duplicates and
//!   out-of-order packets, and maps exceptional conditions to wire-level
//!   ERROR packets.
//! * A recurring per-connection timer resends the most recent DATA, ACK,
//!   or OACK when the peer goes silent. Every received datagram pushes the
//!   deadline, and the retransmit budget bounds how long a dead peer can
//!   hold resources. ERROR packets are fire-and-forget and never resent.
//! * The application integrates through callbacks: `rrq`/`wrq` subscribers
//!   attach a byte source/sink per request, `finish` reports the outcome of
//!   every connection exactly once, `error` carries server-level faults.
//!   The daemon itself never touches the filesystem.
//! * The transfer mode (`octet`, `netascii`) is passed through verbatim;
//!   payload bytes are never transformed. A `netascii` application
//!   normalizes line endings in its handle.
//!
//! ## Packets
//!
//! Every packet starts with a 2-byte big-endian opcode:
//!
//! ```ascii
//! RRQ/WRQ:  01/02 | filename | 00 | mode | 00 | (option | 00 | value | 00)*
//! DATA:     03 | block (u16) | payload (0..blocksize bytes)
//! ACK:      04 | block (u16)
//! ERROR:    05 | code (u16) | message | 00
//! OACK:     06 | (option | 00 | value | 00)*
//! ```
//!
//! A DATA payload shorter than the negotiated block size marks the final
//! block of a transfer; a client acknowledges an OACK with ACK(0).
//!
//! ## Example
//!
//! ```no_run
//! use std::io::Cursor;
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tftpd::{Config, Connection, FileSource, RequestObserver, Server};
//!
//! struct ServeGreeting;
//!
//! #[async_trait]
//! impl RequestObserver for ServeGreeting {
//!     async fn on_request(&self, connection: &mut Connection) {
//!         let data = b"hello from tftpd\n".to_vec();
//!         connection.set_filesize(data.len() as u64);
//!         connection.set_source(Box::new(FileSource::new(Cursor::new(data))));
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut server = Server::new(Config { listen: "*:6969".to_string(), ..Config::default() })?;
//! server.on_rrq(Arc::new(ServeGreeting));
//! server.start().await?;
//! server.recv_loop().await
//! # }
//! ```

mod config;
mod connection;
mod error_code;
mod handle;
mod observer;
mod packet;
mod send_socket;
mod server;

pub use config::Config;
pub use connection::{Connection, Flow, TransferKind, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use error_code::ErrorCode;
pub use handle::{ChunkSink, ChunkSource, FileSink, FileSource};
pub use observer::{ErrorObserver, FinishObserver, RequestObserver};
pub use packet::{Opcode, Packet, Request};
pub use send_socket::SendSocket;
pub use server::Server;
