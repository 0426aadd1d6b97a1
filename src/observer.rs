use crate::connection::Connection;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Subscriber for new rrq/wrq requests. The callback borrows the freshly
///  built connection to attach a byte source/sink (and optionally the
///  transfer size) before the first packet goes out; a connection left
///  without a handle is answered with a "File not found" error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestObserver: Send + Sync + 'static {
    async fn on_request(&self, connection: &mut Connection);
}

/// Subscriber for connection termination. Fires exactly once per
///  connection; `error` is empty on success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FinishObserver: Send + Sync + 'static {
    async fn on_finish(&self, connection: &Connection, error: &str);
}

/// Subscriber for server-level errors outside any one connection: bind or
///  receive faults, unroutable datagrams, capacity exhaustion, missing
///  request subscribers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ErrorObserver: Send + Sync + 'static {
    async fn on_error(&self, message: &str);
}
