use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};
use crate::acceptor::PendingRequest;
use crate::dispatcher::DatagramSink;
use crate::multiplexer::Multiplexer;
use crate::packet::{ConnectionType, ControlType, HandshakePacket, PacketHeader, PacketKind, SocketId};

/// The reliable byte stream a connection runs its conversation on.
///
/// All operations fail once the socket is closed. Closing is the only way to cancel a pending
///  operation, and it is safe to call from any task at any time.
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    async fn connect(&self, remote: SocketAddr) -> anyhow::Result<()>;

    /// Reads at least `min_bytes` (or `buf.len()` if that is smaller) and at most `buf.len()`
    ///  bytes, returning the number of bytes read.
    async fn read(&self, buf: &mut [u8], min_bytes: usize) -> anyhow::Result<usize>;

    /// Returns when all of `buf` was handed to the network.
    async fn write(&self, buf: &[u8]) -> anyhow::Result<()>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Upper bound for how far ahead of the expected sequence number packets are buffered. The
///  effective distance is smaller if the receive buffer cannot hold that many packets.
const MAX_REORDER_DISTANCE: usize = 1 << 16;

const MAX_FLOW_WINDOW_SIZE: u32 = 25600;

struct SocketState {
    open: bool,
    /// true while the id is in the multiplexer's dispatch table
    registered: bool,
    id: Option<SocketId>,
    remote_id: Option<SocketId>,
    remote_endpoint: Option<SocketAddr>,
    peer_closed: bool,
    initial_sequence_number: u32,
    next_send_sequence: u32,
    next_receive_sequence: u32,
    out_of_order: BTreeMap<u32, Vec<u8>>,
    out_of_order_bytes: usize,
    receive_buffer: BytesMut,
    /// bounds `receive_buffer` and `out_of_order_bytes` combined
    max_receive_buffer: usize,
    max_reorder_distance: u32,
    connect_waiter: Option<oneshot::Sender<()>>,
}

impl SocketState {
    /// returns true if new data became readable
    fn on_data(&mut self, sequence_number: u32, payload: &[u8]) -> bool {
        let offset = sequence_number.wrapping_sub(self.next_receive_sequence) & PacketHeader::SEQUENCE_NUMBER_MASK;
        if offset >= self.max_reorder_distance {
            trace!("dropping duplicate or far ahead packet #{}, expecting #{}", sequence_number, self.next_receive_sequence);
            return false;
        }
        if offset != 0 && self.out_of_order.contains_key(&sequence_number) {
            trace!("dropping duplicate packet #{}", sequence_number);
            return false;
        }
        if self.buffered_bytes() + payload.len() > self.max_receive_buffer {
            debug!("receive buffer is full - dropping packet #{}", sequence_number);
            return false;
        }

        if offset == 0 {
            self.receive_buffer.extend_from_slice(payload);
            self.advance_receive_sequence();

            while let Some(buffered) = self.out_of_order.remove(&self.next_receive_sequence) {
                self.out_of_order_bytes -= buffered.len();
                self.receive_buffer.extend_from_slice(&buffered);
                self.advance_receive_sequence();
            }
            true
        }
        else {
            trace!("buffering out-of-order packet #{}, expecting #{}", sequence_number, self.next_receive_sequence);
            self.out_of_order_bytes += payload.len();
            self.out_of_order.insert(sequence_number, payload.to_vec());
            false
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.receive_buffer.len() + self.out_of_order_bytes
    }

    fn advance_receive_sequence(&mut self) {
        self.next_receive_sequence = self.next_receive_sequence.wrapping_add(1) & PacketHeader::SEQUENCE_NUMBER_MASK;
    }

    fn take_send_sequence(&mut self) -> u32 {
        let result = self.next_send_sequence;
        self.next_send_sequence = result.wrapping_add(1) & PacketHeader::SEQUENCE_NUMBER_MASK;
        result
    }

    fn peer(&self) -> Option<(SocketAddr, SocketId)> {
        Some((self.remote_endpoint?, self.remote_id?))
    }
}

/// A logical stream socket multiplexed over the UDP socket of a [Multiplexer].
///
/// It registers itself with the multiplexer for inbound datagrams either when connecting, or
///  when an acceptor binds it to an incoming handshake. Payload is sent as data packets of at
///  most a datagram, and reassembled in sequence number order on the receiving side.
///
/// NB: There is no retransmission or flow control. Lost datagrams stall the stream until the
///      connection on top of it times out.
pub struct UdtSocket {
    multiplexer: Arc<Multiplexer>,
    myself: Weak<UdtSocket>,
    created: Instant,
    state: Mutex<SocketState>,
    readable: Notify,
}

impl UdtSocket {
    pub fn new(multiplexer: &Arc<Multiplexer>) -> Arc<UdtSocket> {
        let initial_sequence_number = rand::random::<u32>() & PacketHeader::SEQUENCE_NUMBER_MASK;
        let config = multiplexer.config();
        let max_payload = config.max_datagram_size.saturating_sub(PacketHeader::SERIALIZED_LEN).max(1);
        let max_reorder_distance = (config.max_receive_buffer / max_payload)
            .clamp(1, MAX_REORDER_DISTANCE) as u32;

        Arc::new_cyclic(|myself| UdtSocket {
            multiplexer: multiplexer.clone(),
            myself: myself.clone(),
            created: Instant::now(),
            state: Mutex::new(SocketState {
                open: true,
                registered: false,
                id: None,
                remote_id: None,
                remote_endpoint: None,
                peer_closed: false,
                initial_sequence_number,
                next_send_sequence: initial_sequence_number,
                next_receive_sequence: 0,
                out_of_order: BTreeMap::new(),
                out_of_order_bytes: 0,
                receive_buffer: BytesMut::new(),
                max_receive_buffer: config.max_receive_buffer,
                max_reorder_distance,
                connect_waiter: None,
            }),
            readable: Notify::new(),
        })
    }

    pub fn as_sink(socket: &Arc<UdtSocket>) -> Weak<dyn DatagramSink> {
        let weak: Weak<UdtSocket> = Arc::downgrade(socket);
        weak
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Option<SocketId> {
        self.lock().id
    }

    pub fn remote_id(&self) -> Option<SocketId> {
        self.lock().remote_id
    }

    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.lock().remote_endpoint
    }

    fn timestamp(&self) -> u32 {
        // wraps after a bit more than an hour, which is fine for an informational field
        self.created.elapsed().as_micros() as u32
    }

    /// Called by the acceptor after it registered this socket with the multiplexer
    pub fn bind_accepted(&self, id: SocketId, request: &PendingRequest) {
        debug!("socket {:?} accepted connection from {:?} (remote socket {:?})", id, request.remote_endpoint, request.remote_id);

        let mut state = self.lock();
        state.id = Some(id);
        state.registered = true;
        state.remote_id = Some(request.remote_id);
        state.remote_endpoint = Some(request.remote_endpoint);
        state.next_receive_sequence = request.initial_sequence_number & PacketHeader::SEQUENCE_NUMBER_MASK;
    }

    /// Completes the handshake of an accepted socket by telling the peer its socket id
    pub async fn send_handshake_response(&self) -> anyhow::Result<()> {
        let (remote_endpoint, handshake) = {
            let state = self.lock();
            if !state.open {
                bail!("socket is closed");
            }
            let (Some(id), Some((remote_endpoint, remote_id))) = (state.id, state.peer()) else {
                bail!("socket was not accepted");
            };
            (remote_endpoint, self.handshake(&state, ConnectionType::Response, remote_id, id, remote_endpoint))
        };
        self.multiplexer.send_to(remote_endpoint, &handshake.encode()).await
    }

    fn handshake(&self, state: &SocketState, connection_type: ConnectionType, destination_socket_id: SocketId, socket_id: SocketId, remote_endpoint: SocketAddr) -> HandshakePacket {
        HandshakePacket {
            destination_socket_id,
            timestamp: self.timestamp(),
            initial_sequence_number: state.initial_sequence_number,
            maximum_packet_size: self.multiplexer.config().max_datagram_size as u32,
            maximum_flow_window_size: MAX_FLOW_WINDOW_SIZE,
            connection_type,
            socket_id,
            syn_cookie: 0,
            ip_address: remote_endpoint.ip(),
        }
    }

    fn on_handshake(&self, state: &mut SocketState, packet: &[u8]) {
        match HandshakePacket::decode(packet) {
            Some(handshake) if handshake.connection_type == ConnectionType::Response => {
                if let Some(waiter) = state.connect_waiter.take() {
                    debug!("connected to remote socket {:?}", handshake.socket_id);
                    state.remote_id = Some(handshake.socket_id);
                    state.next_receive_sequence = handshake.initial_sequence_number & PacketHeader::SEQUENCE_NUMBER_MASK;
                    let _ = waiter.send(());
                }
                else {
                    trace!("ignoring duplicate handshake response");
                }
            }
            _ => debug!("ignoring unexpected handshake"),
        }
    }
}

impl DatagramSink for UdtSocket {
    fn handle_datagram(&self, packet: &[u8], from: SocketAddr) {
        let mut buf = packet;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping invalid packet from {:?}: {}", from, e);
                return;
            }
        };

        let mut state = self.lock();
        if !state.open {
            return;
        }
        if state.remote_endpoint != Some(from) {
            debug!("dropping packet from unexpected endpoint {:?}", from);
            return;
        }

        let wake_reader = match header.kind {
            PacketKind::Control(ControlType::Handshake) => {
                self.on_handshake(&mut state, packet);
                false
            }
            PacketKind::Control(ControlType::Shutdown) => {
                debug!("peer closed the connection");
                state.peer_closed = true;
                true
            }
            PacketKind::Data { sequence_number } => {
                state.on_data(sequence_number, buf)
            }
        };
        drop(state);

        if wake_reader {
            self.readable.notify_one();
        }
    }
}

#[async_trait]
impl StreamSocket for UdtSocket {
    async fn connect(&self, remote: SocketAddr) -> anyhow::Result<()> {
        let (connected, handshake) = {
            let mut state = self.lock();
            if !state.open {
                bail!("socket is closed");
            }
            if state.id.is_some() {
                bail!("socket is already connected");
            }

            let sink: Weak<dyn DatagramSink> = self.myself.clone();
            let id = self.multiplexer.dispatcher().add_socket(sink);
            state.id = Some(id);
            state.registered = true;
            state.remote_endpoint = Some(remote);

            let (waiter, connected) = oneshot::channel();
            state.connect_waiter = Some(waiter);
            (connected, self.handshake(&state, ConnectionType::Request, SocketId::NONE, id, remote))
        };

        debug!("connecting to {:?}", remote);
        self.multiplexer.send_to(remote, &handshake.encode()).await?;

        connected.await
            .map_err(|_| anyhow!("socket was closed while connecting"))
    }

    async fn read(&self, buf: &mut [u8], min_bytes: usize) -> anyhow::Result<usize> {
        let min_bytes = min_bytes.clamp(1, buf.len().max(1));
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut state = self.lock();
                if !state.open {
                    bail!("socket is closed");
                }
                if state.receive_buffer.len() >= min_bytes {
                    let n = state.receive_buffer.len().min(buf.len());
                    let data = state.receive_buffer.split_to(n);
                    buf[..n].copy_from_slice(&data);
                    return Ok(n);
                }
                if state.peer_closed {
                    bail!("connection was closed by the peer");
                }
            }
            // a notification between releasing the lock and waiting is stored as a permit
            self.readable.notified().await;
        }
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        let max_payload = self.multiplexer.config().max_datagram_size - PacketHeader::SERIALIZED_LEN;

        for chunk in buf.chunks(max_payload) {
            let (remote_endpoint, packet) = {
                let mut state = self.lock();
                if !state.open {
                    bail!("socket is closed");
                }
                if state.peer_closed {
                    bail!("connection was closed by the peer");
                }
                let Some((remote_endpoint, remote_id)) = state.peer() else {
                    bail!("socket is not connected");
                };

                let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + chunk.len());
                PacketHeader::data(state.take_send_sequence(), self.timestamp(), remote_id)
                    .ser(&mut packet);
                packet.put_slice(chunk);
                (remote_endpoint, packet)
            };
            self.multiplexer.send_to(remote_endpoint, &packet).await?;
        }
        Ok(())
    }

    fn close(&self) {
        let (id, shutdown) = {
            let mut state = self.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.connect_waiter = None;

            let id = state.id.filter(|_| state.registered);
            state.registered = false;

            let shutdown = match state.peer() {
                Some((remote_endpoint, remote_id)) if !state.peer_closed => {
                    let mut packet = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
                    PacketHeader::control(ControlType::Shutdown, self.timestamp(), remote_id)
                        .ser(&mut packet);
                    Some((remote_endpoint, packet))
                }
                _ => None,
            };
            (id, shutdown)
        };

        debug!("closing socket {:?}", id);
        if let Some(id) = id {
            self.multiplexer.dispatcher().remove_socket(id);
        }
        if let Some((remote_endpoint, packet)) = shutdown {
            if let Err(e) = self.multiplexer.try_send_to(remote_endpoint, &packet) {
                debug!("could not notify peer of shutdown: {}", e);
            }
        }
        self.readable.notify_one();
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl Drop for UdtSocket {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let (true, Some(id)) = (state.registered, state.id) {
            self.multiplexer.dispatcher().remove_socket(id);
        }
    }
}
