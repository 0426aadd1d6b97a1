use crate::config::Config;
use crate::connection::{Connection, Flow, TransferKind, MAX_BLOCK_SIZE};
use crate::error_code::ErrorCode;
use crate::observer::{ErrorObserver, FinishObserver, RequestObserver};
use crate::packet::{Opcode, Packet, Request};
use crate::send_socket::SendSocket;
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, error, info, trace, warn};

/// One entry of the connection table: the shared connection state plus its
///  retransmit timer task. Dropping the entry cancels the timer.
struct ConnectionEntry {
    conn: Arc<Mutex<Connection>>,
    timer: JoinHandle<()>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

type ConnectionTable = FxHashMap<SocketAddr, ConnectionEntry>;

/// A terminal state reached on the timer path, reported back to the
///  receive loop, which owns the table and fires `finish`.
struct Removal {
    peer: SocketAddr,
    conn: Arc<Mutex<Connection>>,
    error: String,
}

/// The dispatcher: owns the single listening socket and the connection
///  table keyed by peer endpoint, routes datagrams to connections, and
///  fans lifecycle events out to the registered subscribers.
pub struct Server {
    config: Config,
    socket: Option<Arc<UdpSocket>>,
    rrq_observers: Vec<Arc<dyn RequestObserver>>,
    wrq_observers: Vec<Arc<dyn RequestObserver>>,
    finish_observers: Vec<Arc<dyn FinishObserver>>,
    error_observers: Vec<Arc<dyn ErrorObserver>>,
}

impl Server {
    pub fn new(config: Config) -> anyhow::Result<Server> {
        config.validate()?;
        Ok(Server {
            config,
            socket: None,
            rrq_observers: Vec::new(),
            wrq_observers: Vec::new(),
            finish_observers: Vec::new(),
            error_observers: Vec::new(),
        })
    }

    pub fn on_rrq(&mut self, observer: Arc<dyn RequestObserver>) -> &mut Server {
        self.rrq_observers.push(observer);
        self
    }

    pub fn on_wrq(&mut self, observer: Arc<dyn RequestObserver>) -> &mut Server {
        self.wrq_observers.push(observer);
        self
    }

    pub fn on_finish(&mut self, observer: Arc<dyn FinishObserver>) -> &mut Server {
        self.finish_observers.push(observer);
        self
    }

    pub fn on_error(&mut self, observer: Arc<dyn ErrorObserver>) -> &mut Server {
        self.error_observers.push(observer);
        self
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Binds the configured listen endpoint. Idempotent once bound; a bind
    ///  failure is reported on the `error` event as well as returned.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let addr = self.config.listen_addr()?;
        let socket = match UdpSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                self.emit_error(&format!("Can't create listen socket: {}", e)).await;
                return Err(e.into());
            }
        };
        info!("listening on {:?}", socket.local_addr()?);
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    /// Services the socket until the future is dropped. Dropping it (or
    ///  the server) aborts every per-connection timer.
    pub async fn recv_loop(&self) -> anyhow::Result<()> {
        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => bail!("recv_loop requires start() first"),
        };

        let mut connections: ConnectionTable = FxHashMap::default();
        let (removals_tx, mut removals_rx) = mpsc::channel::<Removal>(64);
        let mut buf = vec![0u8; 4 + MAX_BLOCK_SIZE];

        loop {
            select! {
                received = socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            self.emit_error(&format!("Recv: {}", e)).await;
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..num_read], from, &socket, &mut connections, &removals_tx).await;
                }
                Some(removal) = removals_rx.recv() => {
                    // a stale removal may name a peer that has since opened
                    //  a fresh connection
                    let is_current = connections
                        .get(&removal.peer)
                        .map(|entry| Arc::ptr_eq(&entry.conn, &removal.conn))
                        .unwrap_or(false);
                    if is_current {
                        self.close_connection(&mut connections, removal.peer, &removal.error).await;
                    }
                }
            }
        }
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
        connections: &mut ConnectionTable,
        removals: &mpsc::Sender<Removal>,
    ) {
        trace!("received {} bytes from {:?}", data.len(), from);

        let packet = match Packet::deser(&mut &*data) {
            Ok(packet) => packet,
            Err(e) => {
                let known_opcode = data.len() >= 2
                    && Opcode::from_u16(u16::from_be_bytes([data[0], data[1]])).is_some();
                if !known_opcode && connections.contains_key(&from) {
                    // an opcode outside the protocol ends the transfer,
                    //  without an ERROR packet on the wire
                    self.close_connection(connections, from, "Unknown opcode").await;
                    return;
                }
                warn!("unparsable datagram from {:?}: {}", from, e);
                self.emit_error(&format!("Unparsable datagram from {}: {}", from, e)).await;
                return;
            }
        };

        match packet {
            Packet::Rrq(request) => {
                self.new_request(TransferKind::Rrq, request, from, socket, connections, removals).await
            }
            Packet::Wrq(request) => {
                self.new_request(TransferKind::Wrq, request, from, socket, connections, removals).await
            }
            other => {
                let Some(entry) = connections.get(&from) else {
                    debug!("{:?} from {:?} without a connection - dropping", other.opcode(), from);
                    self.emit_error(&format!("{} has no connection", from)).await;
                    return;
                };

                let conn = entry.conn.clone();
                let flow = {
                    let mut conn = conn.lock().await;
                    // the datagram wins over a concurrently pending timer fire
                    conn.touch();
                    match other {
                        Packet::Ack { block } => conn.receive_ack(block).await,
                        Packet::Data { block, payload } => conn.receive_data(block, &payload).await,
                        Packet::Error { code, message } => {
                            debug!("client {:?} aborted: ({}) {}", from, code, message);
                            Flow::Failed(format!("({}) {}", code, message))
                        }
                        _ => Flow::Failed("Unknown opcode".to_string()),
                    }
                };

                match flow {
                    Flow::Continue => {}
                    Flow::Done => self.close_connection(connections, from, "").await,
                    Flow::Failed(error) => self.close_connection(connections, from, &error).await,
                }
            }
        }
    }

    async fn new_request(
        &self,
        kind: TransferKind,
        request: Request,
        from: SocketAddr,
        socket: &Arc<UdpSocket>,
        connections: &mut ConnectionTable,
        removals: &mpsc::Sender<Removal>,
    ) {
        let observers = match kind {
            TransferKind::Rrq => &self.rrq_observers,
            TransferKind::Wrq => &self.wrq_observers,
        };
        if observers.is_empty() {
            self.emit_error(&format!("Cannot handle {} requests", kind)).await;
            return;
        }

        // the peer endpoint is the sole connection key, so a repeated
        //  request from a live peer supersedes its transfer
        if connections.contains_key(&from) {
            self.close_connection(connections, from, "Superseded by new request").await;
        }
        if connections.len() >= self.config.max_connections {
            self.emit_error("Max connections reached").await;
            return;
        }

        debug!("{} for {:?} from {:?}", kind, request.filename, from);
        let send_socket: Arc<dyn SendSocket> = socket.clone();
        let mut conn = Connection::new(kind, request, from, send_socket, &self.config);

        for observer in observers {
            observer.on_request(&mut conn).await;
        }
        conn.negotiate();

        let flow = if !conn.has_handle() {
            let message = ErrorCode::FileNotFound.default_message();
            conn.send_error(ErrorCode::FileNotFound, message).await
        } else if conn.oack_pending() {
            conn.send_oack().await
        } else {
            match kind {
                TransferKind::Rrq => conn.send_data().await,
                TransferKind::Wrq => conn.send_ack(0).await,
            }
        };

        match flow {
            Flow::Continue => {
                conn.touch();
                let conn = Arc::new(Mutex::new(conn));
                let timer = tokio::spawn(Self::retransmit_loop(conn.clone(), from, removals.clone()));
                connections.insert(from, ConnectionEntry { conn, timer });
            }
            Flow::Done => self.emit_finish(&conn, "").await,
            Flow::Failed(error) => self.emit_finish(&conn, &error).await,
        }
    }

    /// Recurring per-connection retransmit timer. Every datagram for the
    ///  connection pushes the deadline, so a fire only retransmits when the
    ///  peer has been silent for the full interval.
    async fn retransmit_loop(
        conn: Arc<Mutex<Connection>>,
        peer: SocketAddr,
        removals: mpsc::Sender<Removal>,
    ) {
        loop {
            let deadline = conn.lock().await.deadline();
            sleep_until(deadline).await;

            let flow = {
                let mut conn = conn.lock().await;
                if conn.deadline() > deadline {
                    continue;
                }
                let flow = conn.retransmit().await;
                if flow == Flow::Continue {
                    conn.touch();
                }
                flow
            };

            let error = match flow {
                Flow::Continue => continue,
                Flow::Done => String::new(),
                Flow::Failed(error) => error,
            };
            let _ = removals.send(Removal { peer, conn: conn.clone(), error }).await;
            return;
        }
    }

    async fn close_connection(&self, connections: &mut ConnectionTable, peer: SocketAddr, error: &str) {
        if let Some(entry) = connections.remove(&peer) {
            entry.timer.abort();
            let conn = entry.conn.lock().await;
            self.emit_finish(&conn, error).await;
        }
    }

    async fn emit_finish(&self, connection: &Connection, error: &str) {
        debug!("{} for {:?} from {:?} finished: {:?}", connection.kind(), connection.file(), connection.peer(), error);
        for observer in &self.finish_observers {
            observer.on_finish(connection, error).await;
        }
    }

    async fn emit_error(&self, message: &str) {
        warn!("{}", message);
        for observer in &self.error_observers {
            observer.on_error(message).await;
        }
    }
}
