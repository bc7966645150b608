use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::acceptor::Acceptor;
use crate::config::{ResponseTimeout, TransportConfig};
use crate::connection::{Connection, ConnectionId, ConnectionOwner, MessageInfo, Response, TransportCondition};
use crate::multiplexer::Multiplexer;
use crate::udt_socket::{StreamSocket, UdtSocket};

/// This trait decouples the application from the transport: the transport hands it every
///  received message, and reports problems through it.
///
/// It is passed around as an `Arc<dyn ...>`, and it is called from arbitrary tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// The returned response (if any) is sent back on the connection the message arrived on.
    async fn on_message_received(&self, message: Vec<u8>, info: MessageInfo) -> Option<Response>;

    fn on_error(&self, condition: TransportCondition);
}

struct Listener {
    acceptor: Arc<Acceptor>,
    accept_loop: JoinHandle<()>,
}

struct TransportInner {
    config: Arc<TransportConfig>,
    multiplexer: Arc<Multiplexer>,
    handler: Arc<dyn MessageHandler>,
    /// Connections own themselves while their conversation runs, the registry only tracks them
    connections: Mutex<FxHashMap<ConnectionId, Weak<Connection>>>,
    next_connection_id: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

impl TransportInner {
    fn connections(&self) -> MutexGuard<'_, FxHashMap<ConnectionId, Weak<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_connection(self: &Arc<Self>, socket: Arc<dyn StreamSocket>, remote_endpoint: SocketAddr) -> Arc<Connection> {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let owner: Weak<TransportInner> = Arc::downgrade(self);
        let connection = Connection::new(id, owner, socket, remote_endpoint, self.config.clone());
        self.connections().insert(id, Arc::downgrade(&connection));
        connection
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections().values()
            .filter_map(|c| c.upgrade())
            .collect()
    }

    async fn accept_loop(transport: Weak<TransportInner>, acceptor: Arc<Acceptor>) {
        info!("accepting connections");
        loop {
            let Some(multiplexer) = transport.upgrade().map(|t| t.multiplexer.clone()) else {
                break;
            };

            let socket = UdtSocket::new(&multiplexer);
            if let Err(e) = acceptor.accept(&socket).await {
                debug!("no longer accepting connections: {}", e);
                break;
            }

            let Some(remote_endpoint) = socket.remote_endpoint() else {
                warn!("accepted socket has no remote endpoint - skipping");
                socket.close();
                continue;
            };
            if let Err(e) = socket.send_handshake_response().await {
                warn!("error responding to handshake from {:?}: {}", remote_endpoint, e);
                socket.close();
                continue;
            }

            let Some(inner) = transport.upgrade() else {
                socket.close();
                break;
            };
            debug!("accepted connection from {:?}", remote_endpoint);
            inner.new_connection(socket, remote_endpoint)
                .start_receiving();
        }
        info!("accept loop terminated");
    }
}

#[async_trait]
impl ConnectionOwner for TransportInner {
    async fn on_message_received(&self, message: Vec<u8>, info: MessageInfo) -> Option<Response> {
        self.handler.on_message_received(message, info).await
    }

    fn on_error(&self, condition: TransportCondition) {
        self.handler.on_error(condition);
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.connections().remove(&id);
    }
}

/// A message transport over a single UDP port: every message travels on a connection of its own,
///  optionally followed by a response on the same connection.
///
/// Dropping the transport shuts it down.
pub struct UdtTransport {
    inner: Arc<TransportInner>,
    recv_loop: JoinHandle<()>,
}

impl UdtTransport {
    pub async fn bind(config: TransportConfig, handler: Arc<dyn MessageHandler>) -> anyhow::Result<UdtTransport> {
        let config = Arc::new(config);
        let multiplexer = Multiplexer::bind(config.clone()).await?;

        let recv_multiplexer = multiplexer.clone();
        let recv_loop = tokio::spawn(async move {
            if let Err(e) = recv_multiplexer.recv_loop().await {
                error!("receive loop failed: {}", e);
            }
        });

        Ok(UdtTransport {
            inner: Arc::new(TransportInner {
                config,
                multiplexer,
                handler,
                connections: Default::default(),
                next_connection_id: AtomicU64::new(1),
                listener: Mutex::new(None),
            }),
            recv_loop,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.inner.multiplexer.local_addr()
    }

    /// Starts accepting incoming connections. Fails if the transport is listening already.
    pub fn start_listening(&self) -> anyhow::Result<()> {
        let mut listener = self.inner.listener();
        if listener.is_some() {
            bail!("transport is listening already");
        }

        let acceptor = Acceptor::new(&self.inner.multiplexer)?;
        let accept_loop = tokio::spawn(TransportInner::accept_loop(Arc::downgrade(&self.inner), acceptor.clone()));
        *listener = Some(Listener {
            acceptor,
            accept_loop,
        });
        Ok(())
    }

    /// Stops accepting connections. Connections that were accepted already are not affected.
    pub fn stop_listening(&self) {
        if let Some(listener) = self.inner.listener().take() {
            info!("stop listening");
            // the waiting accept fails, which terminates the accept loop
            listener.acceptor.close();
            drop(listener.accept_loop);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener().is_some()
    }

    /// Sends a message on a new connection, and then either closes the connection or waits for a
    ///  response to hand to the [MessageHandler]. Problems are reported to the handler's error
    ///  callback.
    ///
    /// The returned handle completes when the connection is closed.
    pub fn send(&self, message: &[u8], to: SocketAddr, response_timeout: ResponseTimeout) -> JoinHandle<()> {
        let socket = UdtSocket::new(&self.inner.multiplexer);
        self.inner.new_connection(socket, to)
            .start_sending(message, response_timeout)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.live_connections().len()
    }

    /// Stops listening, closes all connections and terminates the receive loop
    pub fn shutdown(&self) {
        info!("shutting down transport");
        self.stop_listening();
        for connection in self.inner.live_connections() {
            connection.close();
        }
        self.inner.multiplexer.close();
    }
}

impl Drop for UdtTransport {
    fn drop(&mut self) {
        if !self.recv_loop.is_finished() {
            self.shutdown();
        }
    }
}
