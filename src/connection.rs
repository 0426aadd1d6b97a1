use crate::config::Config;
use crate::error_code::ErrorCode;
use crate::handle::{ChunkSink, ChunkSource};
use crate::packet::{Opcode, Packet, Request};
use crate::send_socket::SendSocket;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
pub const DEFAULT_BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Read request: data flows server -> client.
    Rrq,
    /// Write request: data flows client -> server.
    Wrq,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Rrq => write!(f, "rrq"),
            TransferKind::Wrq => write!(f, "wrq"),
        }
    }
}

/// What the dispatcher does with a connection after one of its operations:
///  keep it, or remove it with the given outcome. `Done` closes with an
///  empty error string, `Failed` with a descriptive one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Flow {
    Continue,
    Done,
    Failed(String),
}

/// Outcome of putting one packet on the wire.
enum Transmit {
    Sent,
    /// Short or failed send: a retry was spent, the timer will resend.
    Deferred,
    Exhausted(String),
}

/// One active transfer, keyed by its peer endpoint for its whole lifetime.
///
/// All mutation happens under the dispatcher's serialization; each
///  operation sends at most one datagram and reports via [`Flow`] whether
///  the connection stays alive.
pub struct Connection {
    kind: TransferKind,
    file: String,
    mode: String,
    peer: SocketAddr,
    options: FxHashMap<String, String>,
    /// Options accepted for echo, in negotiation order.
    oack: Vec<(String, String)>,
    source: Option<Box<dyn ChunkSource>>,
    sink: Option<Box<dyn ChunkSink>>,
    filesize: Option<u64>,
    blocksize: usize,
    timeout: Duration,
    retries: u32,
    /// Next expected block. Kept wider than the wire field so read offsets
    ///  stay correct past 65535 blocks; the low 16 bits go on the wire.
    sequence_number: u64,
    last_sequence_number: Option<u64>,
    lastop: Option<Opcode>,
    bytes_written: u64,
    deadline: Instant,
    socket: Arc<dyn SendSocket>,
}

fn wire_block(sequence_number: u64) -> u16 {
    (sequence_number & 0xffff) as u16
}

impl Connection {
    pub fn new(
        kind: TransferKind,
        request: Request,
        peer: SocketAddr,
        socket: Arc<dyn SendSocket>,
        config: &Config,
    ) -> Connection {
        Connection {
            kind,
            file: request.filename,
            mode: request.mode,
            peer,
            options: request.options,
            oack: Vec::new(),
            source: None,
            sink: None,
            filesize: None,
            blocksize: DEFAULT_BLOCK_SIZE,
            timeout: config.retransmit_timeout,
            retries: config.retries,
            sequence_number: 1,
            last_sequence_number: None,
            lastop: None,
            bytes_written: 0,
            deadline: Instant::now() + config.retransmit_timeout,
            socket,
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// The filename exactly as the client requested it.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// The transfer mode, lowercased. The daemon streams bytes verbatim in
    ///  every mode; a `netascii` application normalizes in its handle.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The option table from the request, names lowercased.
    pub fn options(&self) -> &FxHashMap<String, String> {
        &self.options
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn filesize(&self) -> Option<u64> {
        self.filesize
    }

    /// For rrq: the size reported back in the `tsize` OACK option.
    pub fn set_filesize(&mut self, filesize: u64) {
        self.filesize = Some(filesize);
    }

    pub fn set_source(&mut self, source: Box<dyn ChunkSource>) {
        self.source = Some(source);
    }

    pub fn set_sink(&mut self, sink: Box<dyn ChunkSink>) {
        self.sink = Some(sink);
    }

    pub(crate) fn has_handle(&self) -> bool {
        match self.kind {
            TransferKind::Rrq => self.source.is_some(),
            TransferKind::Wrq => self.sink.is_some(),
        }
    }

    pub(crate) fn oack_pending(&self) -> bool {
        !self.oack.is_empty()
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Pushes the retransmit deadline; called for every datagram received
    ///  for this connection, before it is dispatched.
    pub(crate) fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Decides which request options are accepted and echoed. Runs after
    ///  the application callbacks so an rrq `tsize` can echo the attached
    ///  file size.
    pub(crate) fn negotiate(&mut self) {
        if let Some(requested) = self.options.get("blksize").and_then(|v| v.parse::<usize>().ok()) {
            let clamped = requested.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
            self.blocksize = clamped;
            self.oack.push(("blksize".to_string(), clamped.to_string()));
        }

        if let Some(raw) = self.options.get("timeout") {
            if let Ok(seconds) = raw.parse::<u64>() {
                if seconds <= 255 {
                    // echoed verbatim; the timer clamps 0 up to one second
                    self.timeout = Duration::from_secs(seconds.max(1));
                    self.oack.push(("timeout".to_string(), raw.clone()));
                }
            }
        }

        if self.options.contains_key("tsize") {
            match self.kind {
                TransferKind::Rrq => {
                    if let Some(filesize) = self.filesize {
                        self.oack.push(("tsize".to_string(), filesize.to_string()));
                    }
                }
                TransferKind::Wrq => {
                    // upload cap, recorded but not echoed
                    if let Some(cap) = self.options.get("tsize").and_then(|v| v.parse::<u64>().ok()) {
                        self.filesize = Some(cap);
                    }
                }
            }
        }
    }

    /// Spends one retransmit attempt. `Some(error)` when the budget is
    ///  already empty, which terminates the connection.
    fn spend_retry(&mut self, context: &str) -> Option<String> {
        if self.retries == 0 {
            debug!("retry budget exhausted for {:?}: {}", self.peer, context);
            return Some(context.to_string());
        }
        self.retries -= 1;
        trace!("{} for {:?}, {} retries left", context, self.peer, self.retries);
        None
    }

    async fn transmit(&mut self, packet: &Packet, op: Opcode, context: &str) -> Transmit {
        let mut buf = BytesMut::with_capacity(4 + self.blocksize);
        packet.ser(&mut buf);

        // recorded before the send so the timer resends exactly this
        //  packet even when the send itself falls short
        self.lastop = Some(op);

        let sent = self.socket.send_packet(self.peer, &buf).await;
        match sent {
            Ok(sent) if sent == buf.len() => Transmit::Sent,
            Ok(sent) => {
                warn!("short send to {:?}: {} of {} bytes", self.peer, sent, buf.len());
                match self.spend_retry(context) {
                    None => Transmit::Deferred,
                    Some(error) => Transmit::Exhausted(error),
                }
            }
            Err(e) => {
                warn!("send to {:?} failed: {}", self.peer, e);
                match self.spend_retry(context) {
                    None => Transmit::Deferred,
                    Some(error) => Transmit::Exhausted(error),
                }
            }
        }
    }

    fn flow_of(transmit: Transmit) -> Flow {
        match transmit {
            Transmit::Sent | Transmit::Deferred => Flow::Continue,
            Transmit::Exhausted(error) => Flow::Failed(error),
        }
    }

    /// Reads the current block from the source and puts it on the wire.
    ///  A short read marks the final block; a read error is answered with
    ///  a "File not found" error packet.
    pub async fn send_data(&mut self) -> Flow {
        let offset = (self.sequence_number - 1) * self.blocksize as u64;
        let blocksize = self.blocksize;

        let read = match &mut self.source {
            Some(source) => source.chunk(offset, blocksize).await,
            None => return self.send_error(ErrorCode::FileNotFound, "No file handle").await,
        };
        let payload = match read {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("Read: {}", e);
                return self.send_error(ErrorCode::FileNotFound, &message).await;
            }
        };

        if payload.len() < self.blocksize {
            self.last_sequence_number = Some(self.sequence_number);
        }

        let block = wire_block(self.sequence_number);
        trace!("sending DATA({}) with {} bytes to {:?}", block, payload.len(), self.peer);
        Self::flow_of(self.transmit(&Packet::Data { block, payload }, Opcode::Data, "Partial send").await)
    }

    pub async fn send_ack(&mut self, block: u16) -> Flow {
        trace!("sending ACK({}) to {:?}", block, self.peer);
        Self::flow_of(self.transmit(&Packet::Ack { block }, Opcode::Ack, "Partial send").await)
    }

    pub async fn send_oack(&mut self) -> Flow {
        trace!("sending OACK {:?} to {:?}", self.oack, self.peer);
        let packet = Packet::Oack { options: self.oack.clone() };
        Self::flow_of(self.transmit(&packet, Opcode::Oack, "Partial send").await)
    }

    /// Sends an ERROR packet and terminates the connection. Fire and
    ///  forget: an ERROR is never retransmitted and expects no reply.
    pub async fn send_error(&mut self, code: ErrorCode, message: &str) -> Flow {
        debug!("sending ERROR {} ({:?}) to {:?}", code.code(), message, self.peer);
        let mut buf = BytesMut::new();
        Packet::Error { code: code.code(), message: message.to_string() }.ser(&mut buf);

        self.lastop = Some(Opcode::Error);
        if let Err(e) = self.socket.send_packet(self.peer, &buf).await {
            warn!("sending ERROR to {:?} failed: {}", self.peer, e);
        }
        Flow::Failed(message.to_string())
    }

    /// Handles an inbound ACK during an rrq transfer.
    pub async fn receive_ack(&mut self, block: u16) -> Flow {
        if self.kind == TransferKind::Wrq {
            let message = ErrorCode::IllegalOperation.default_message();
            return self.send_error(ErrorCode::IllegalOperation, message).await;
        }

        if block == 0 && self.lastop == Some(Opcode::Oack) {
            // the OACK acknowledgment; block 1 goes out now
            return self.send_data().await;
        }

        if let Some(last) = self.last_sequence_number {
            if block == wire_block(last) {
                debug!("final block acknowledged by {:?}", self.peer);
                return Flow::Done;
            }
        }

        if block == wire_block(self.sequence_number) {
            self.sequence_number += 1;
            return self.send_data().await;
        }

        match self.spend_retry("Out of order ACK") {
            None => Flow::Continue,
            Some(error) => Flow::Failed(error),
        }
    }

    /// Handles an inbound DATA during a wrq transfer.
    pub async fn receive_data(&mut self, block: u16, payload: &[u8]) -> Flow {
        if self.kind == TransferKind::Rrq {
            let message = ErrorCode::IllegalOperation.default_message();
            return self.send_error(ErrorCode::IllegalOperation, message).await;
        }

        if block != wire_block(self.sequence_number) {
            // the timer resends the previous ACK
            return match self.spend_retry("Out of order DATA") {
                None => Flow::Continue,
                Some(error) => Flow::Failed(error),
            };
        }

        if let Some(cap) = self.filesize {
            if self.bytes_written + payload.len() as u64 > cap {
                return self.send_error(ErrorCode::DiskFull, "tsize exceeded").await;
            }
        }

        let written = match &mut self.sink {
            Some(sink) => sink.append(payload).await,
            None => return self.send_error(ErrorCode::IllegalOperation, "No file handle").await,
        };
        if let Err(e) = written {
            let message = format!("Write: {}", e);
            return self.send_error(ErrorCode::IllegalOperation, &message).await;
        }
        self.bytes_written += payload.len() as u64;

        let is_last = payload.len() < self.blocksize;
        if is_last {
            self.last_sequence_number = Some(self.sequence_number);
        }
        self.sequence_number += 1;

        let transmit = self.transmit(&Packet::Ack { block }, Opcode::Ack, "Partial send").await;
        match transmit {
            Transmit::Sent if is_last => {
                debug!("upload from {:?} complete after {} bytes", self.peer, self.bytes_written);
                Flow::Done
            }
            Transmit::Sent | Transmit::Deferred => Flow::Continue,
            Transmit::Exhausted(error) => Flow::Failed(error),
        }
    }

    /// Timer fire without progress: resend whatever went out last and
    ///  spend one retry. An ERROR is never resent; the fire removes the
    ///  connection instead.
    pub async fn retransmit(&mut self) -> Flow {
        let op = match self.lastop {
            Some(Opcode::Error) | None => return Flow::Failed("Inactive timeout".to_string()),
            Some(op) => op,
        };

        if let Some(error) = self.spend_retry("Inactive timeout") {
            return Flow::Failed(error);
        }

        debug!("retransmitting {:?} to {:?}, {} retries left", op, self.peer, self.retries);
        match op {
            Opcode::Data => self.send_data().await,
            Opcode::Oack => self.send_oack().await,
            Opcode::Ack => {
                let acked = self.sequence_number - 1;
                let block = wire_block(acked);
                let is_final = self.last_sequence_number == Some(acked);
                let transmit = self.transmit(&Packet::Ack { block }, Opcode::Ack, "Partial send").await;
                match transmit {
                    Transmit::Sent if is_final => Flow::Done,
                    Transmit::Sent | Transmit::Deferred => Flow::Continue,
                    Transmit::Exhausted(error) => Flow::Failed(error),
                }
            }
            other => {
                warn!("cannot retransmit {:?} for {:?}", other, self.peer);
                Flow::Failed("Inactive timeout".to_string())
            }
        }
    }
}
