use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};
use crate::config::TransportConfig;
use crate::dispatcher::Dispatcher;
use crate::packet::{PacketHeader, SocketId};

/// This is an abstraction for the physical UDP socket, introduced to facilitate mocking the I/O
///  part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()>;

    /// Non-blocking send for contexts that can not await, e.g. closing a socket
    fn try_send_datagram(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()>;

    async fn recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet, to).await?;
        Ok(())
    }

    fn try_send_datagram(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending packet to {:?} without waiting", to);
        self.try_send_to(packet, to)?;
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.recv_from(buf).await?)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}

/// The multiplexer is the single owner of the UDP socket for a local endpoint. All stream sockets
///  of that endpoint send through it, and its receive loop routes every inbound datagram to the
///  socket it is addressed to - or to the acceptor if it is not addressed to a registered socket.
pub struct Multiplexer {
    socket: Arc<dyn DatagramSocket>,
    dispatcher: Dispatcher,
    config: Arc<TransportConfig>,
    shutdown: watch::Sender<bool>,
}

impl Multiplexer {
    pub async fn bind(config: Arc<TransportConfig>) -> anyhow::Result<Arc<Multiplexer>> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound multiplexer socket to {:?}", socket.local_addr()?);
        Ok(Self::new(Arc::new(socket), config))
    }

    pub fn new(socket: Arc<dyn DatagramSocket>, config: Arc<TransportConfig>) -> Arc<Multiplexer> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Multiplexer {
            socket,
            dispatcher: Dispatcher::new(),
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub async fn send_to(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        self.socket.send_datagram(to, packet).await
    }

    pub fn try_send_to(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        self.socket.try_send_datagram(to, packet)
    }

    /// Terminates the receive loop. Registered sockets are not affected.
    pub fn close(&self) {
        info!("closing multiplexer");
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn recv_loop(&self) -> anyhow::Result<()> {
        info!("starting receive loop");

        let mut shutdown = self.shutdown.subscribe();
        // one extra byte to detect datagrams exceeding the configured size
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            select! {
                _ = shutdown.changed() => continue,
                r = self.socket.recv_datagram(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if len > self.config.max_datagram_size {
                                debug!("received datagram from {:?} exceeding max datagram size of {} bytes - dropping", from, self.config.max_datagram_size);
                                continue;
                            }
                            self.dispatch(&buf[..len], from);
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
            }
        }

        info!("receive loop terminated");
        Ok(())
    }

    /// Routes a single datagram. This runs for every inbound datagram, so it does hash lookups
    ///  only and hands the data off without awaiting.
    pub fn dispatch(&self, packet: &[u8], from: SocketAddr) {
        let Some(destination) = PacketHeader::peek_destination_socket_id(packet) else {
            debug!("received datagram from {:?} that is too short for a packet header - dropping", from);
            return;
        };

        if destination != SocketId::NONE {
            if let Some(socket) = self.dispatcher.socket(destination) {
                trace!("routing {} bytes from {:?} to socket {:?}", packet.len(), from, destination);
                socket.handle_datagram(packet, from);
                return;
            }
        }

        if let Some(acceptor) = self.dispatcher.acceptor() {
            trace!("routing {} bytes from {:?} to acceptor", packet.len(), from);
            acceptor.handle_receive_from(packet, from);
        }
        else {
            debug!("datagram from {:?} for socket {:?}: no such socket and no acceptor - dropping", from, destination);
        }
    }
}
