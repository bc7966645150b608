use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::select;
use tokio::sync::watch;
use crate::config::TransportConfig;
use crate::connection::{ConnectionId, ConnectionOwner, MessageInfo, Response, TransportCondition};
use crate::dispatcher::DatagramSink;
use crate::packet::{ConnectionType, ControlType, HandshakePacket, PacketHeader, SocketId};
use crate::udt_socket::StreamSocket;

/// The default configuration, with a port that lets the OS choose
pub fn test_config() -> TransportConfig {
    TransportConfig::default_ipv4(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
}

pub fn handshake_request(destination_socket_id: SocketId, socket_id: SocketId) -> HandshakePacket {
    HandshakePacket {
        destination_socket_id,
        timestamp: 0,
        initial_sequence_number: 0,
        maximum_packet_size: 1472,
        maximum_flow_window_size: 25600,
        connection_type: ConnectionType::Request,
        socket_id,
        syn_cookie: 0,
        ip_address: Ipv4Addr::LOCALHOST.into(),
    }
}

pub fn data_packet(destination_socket_id: SocketId, sequence_number: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    PacketHeader::data(sequence_number, 0, destination_socket_id).ser(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn shutdown_packet(destination_socket_id: SocketId) -> Vec<u8> {
    let mut buf = BytesMut::new();
    PacketHeader::control(ControlType::Shutdown, 0, destination_socket_id).ser(&mut buf);
    buf.to_vec()
}

/// Records everything the multiplexer routes to it
#[derive(Default)]
pub struct CollectingSink {
    packets: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}
impl CollectingSink {
    pub fn packets(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.packets.lock().unwrap().clone()
    }
}
impl DatagramSink for CollectingSink {
    fn handle_datagram(&self, packet: &[u8], from: SocketAddr) {
        self.packets.lock().unwrap().push((packet.to_vec(), from));
    }
}

pub enum ReadStep {
    Data(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Fail,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    Fail,
    Hang,
}

/// A stream socket that plays back a script of reads, records writes, and honors closing the
///  way a real socket does: every pending or later operation fails.
///
/// When the script is exhausted, reads wait until the socket is closed.
pub struct ScriptedSocket {
    reads: Mutex<VecDeque<ReadStep>>,
    read_sizes: Mutex<Vec<usize>>,
    written: Mutex<Vec<Vec<u8>>>,
    connected_to: Mutex<Option<SocketAddr>>,
    connect_behavior: Behavior,
    write_behavior: Behavior,
    closed: watch::Sender<bool>,
}

impl Default for ScriptedSocket {
    fn default() -> Self {
        let (closed, _) = watch::channel(false);
        ScriptedSocket {
            reads: Default::default(),
            read_sizes: Default::default(),
            written: Default::default(),
            connected_to: Default::default(),
            connect_behavior: Behavior::Succeed,
            write_behavior: Behavior::Succeed,
            closed,
        }
    }
}

impl ScriptedSocket {
    pub fn with_reads(reads: Vec<ReadStep>) -> ScriptedSocket {
        ScriptedSocket {
            reads: Mutex::new(reads.into()),
            ..Default::default()
        }
    }

    pub fn failing_connect(mut self) -> ScriptedSocket {
        self.connect_behavior = Behavior::Fail;
        self
    }

    pub fn hanging_connect(mut self) -> ScriptedSocket {
        self.connect_behavior = Behavior::Hang;
        self
    }

    pub fn failing_write(mut self) -> ScriptedSocket {
        self.write_behavior = Behavior::Fail;
        self
    }

    pub fn hanging_write(mut self) -> ScriptedSocket {
        self.write_behavior = Behavior::Hang;
        self
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn num_reads(&self) -> usize {
        self.read_sizes.lock().unwrap().len()
    }

    pub fn read_sizes(&self) -> Vec<usize> {
        self.read_sizes.lock().unwrap().clone()
    }

    pub fn connected_to(&self) -> Option<SocketAddr> {
        *self.connected_to.lock().unwrap()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn act(&self, behavior: Behavior, what: &str) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("{}: socket is closed", what);
        }
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => bail!("{} failed", what),
            Behavior::Hang => {
                self.closed().await;
                bail!("{}: socket was closed", what)
            }
        }
    }
}

#[async_trait]
impl StreamSocket for ScriptedSocket {
    async fn connect(&self, remote: SocketAddr) -> anyhow::Result<()> {
        self.act(self.connect_behavior, "connect").await?;
        *self.connected_to.lock().unwrap() = Some(remote);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8], _min_bytes: usize) -> anyhow::Result<usize> {
        if !self.is_open() {
            bail!("read: socket is closed");
        }
        self.read_sizes.lock().unwrap().push(buf.len());

        let step = self.reads.lock().unwrap().pop_front();
        let data = match step {
            None => {
                self.closed().await;
                bail!("read: socket was closed");
            }
            Some(ReadStep::Fail) => bail!("read failed"),
            Some(ReadStep::Data(data)) => data,
            Some(ReadStep::Delayed(delay, data)) => {
                select! {
                    _ = tokio::time::sleep(delay) => data,
                    _ = self.closed() => bail!("read: socket was closed"),
                }
            }
        };

        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            self.reads.lock().unwrap().push_front(ReadStep::Data(data[n..].to_vec()));
        }
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.act(self.write_behavior, "write").await?;
        self.written.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// Records the callbacks of connections, answering messages from a list of canned responses
///  (and with `None` when that is exhausted)
#[derive(Default)]
pub struct CollectingOwner {
    responses: Mutex<VecDeque<Option<Response>>>,
    handler_delay: Option<Duration>,
    panic_in_handler: bool,
    messages: Mutex<Vec<(Vec<u8>, MessageInfo)>>,
    errors: Mutex<Vec<TransportCondition>>,
    removed: Mutex<Vec<ConnectionId>>,
}

impl CollectingOwner {
    pub fn with_responses(responses: Vec<Option<Response>>) -> CollectingOwner {
        CollectingOwner {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn panicking() -> CollectingOwner {
        CollectingOwner {
            panic_in_handler: true,
            ..Default::default()
        }
    }

    pub fn with_handler_delay(mut self, delay: Duration) -> CollectingOwner {
        self.handler_delay = Some(delay);
        self
    }

    pub fn messages(&self) -> Vec<(Vec<u8>, MessageInfo)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<TransportCondition> {
        self.errors.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<ConnectionId> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionOwner for CollectingOwner {
    async fn on_message_received(&self, message: Vec<u8>, info: MessageInfo) -> Option<Response> {
        if self.panic_in_handler {
            panic!("handler panic on purpose");
        }
        self.messages.lock().unwrap().push((message, info));
        if let Some(delay) = self.handler_delay {
            tokio::time::sleep(delay).await;
        }
        self.responses.lock().unwrap().pop_front().flatten()
    }

    fn on_error(&self, condition: TransportCondition) {
        self.errors.lock().unwrap().push(condition);
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.removed.lock().unwrap().push(id);
    }
}
