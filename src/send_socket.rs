use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::trace;

/// The single shared UDP send path, abstracted so the I/O side can be
///  mocked in tests. Returns the number of bytes actually written: callers
///  treat a short write as a recoverable condition and leave the
///  retransmit timer to repair it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        trace!("sending {} bytes to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await
    }
}
