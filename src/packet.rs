//! Packet codec. All numbers are in network byte order (BE).
//!
//! Every packet starts with the same header:
//!
//! ```ascii
//!  0: flags and sequence number (u32):
//!     * bit 31: 0 for a data packet, 1 for a control packet
//!     * data packets: bits 0-30 are the packet sequence number
//!     * control packets: bits 16-30 are the control type, bits 0-15 are unused
//!  4: additional info (control packets) or message number (data packets), u32
//!  8: timestamp (u32) - micros since the sending socket was created, informational only
//! 12: destination socket id (u32) - the logical socket the packet is addressed to, or 0 for
//!      handshakes that are not addressed to a socket yet
//! ```
//!
//! Control type 0 is a handshake. Its body follows the header:
//!
//! ```ascii
//! 16: protocol version (u32), always 4
//! 20: socket type (u32), 1 for stream sockets
//! 24: initial packet sequence number (u32)
//! 28: maximum packet size (u32)
//! 32: maximum flow window size (u32)
//! 36: connection type (i32): 1 for a request, -1 for a response
//! 40: socket id of the sender (u32)
//! 44: SYN cookie (u32)
//! 48: IP address of the peer as seen by the sender (16 bytes, IPV4 is stored IPV4-mapped)
//! ```
//!
//! Control type 5 is a shutdown and has no body.

use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv6Addr};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

/// Identifies one endpoint of a stream socket within a multiplexer's dispatch table.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketId(pub u32);
impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}
impl SocketId {
    /// Destination of packets that are not addressed to an established socket, i.e. handshake
    ///  requests for the acceptor. It is never assigned to a socket.
    pub const NONE: SocketId = SocketId(0);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 0,
    Shutdown = 5,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketKind {
    Data { sequence_number: u32 },
    Control(ControlType),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub additional_info: u32,
    pub timestamp: u32,
    pub destination_socket_id: SocketId,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 4 * size_of::<u32>();

    pub const SEQUENCE_NUMBER_MASK: u32 = 0x7fff_ffff;
    const CONTROL_FLAG: u32 = 0x8000_0000;

    pub fn data(sequence_number: u32, timestamp: u32, destination_socket_id: SocketId) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Data { sequence_number: sequence_number & Self::SEQUENCE_NUMBER_MASK },
            additional_info: 0,
            timestamp,
            destination_socket_id,
        }
    }

    pub fn control(control_type: ControlType, timestamp: u32, destination_socket_id: SocketId) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Control(control_type),
            additional_info: 0,
            timestamp,
            destination_socket_id,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let first = match self.kind {
            PacketKind::Data { sequence_number } => sequence_number & Self::SEQUENCE_NUMBER_MASK,
            PacketKind::Control(control_type) => Self::CONTROL_FLAG | (u16::from(control_type) as u32) << 16,
        };
        buf.put_u32(first);
        buf.put_u32(self.additional_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination_socket_id.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet is shorter than the packet header: {} < {} bytes", buf.remaining(), Self::SERIALIZED_LEN);
        }

        let first = buf.get_u32();
        let kind = if first & Self::CONTROL_FLAG == 0 {
            PacketKind::Data { sequence_number: first }
        }
        else {
            let raw_type = ((first & !Self::CONTROL_FLAG) >> 16) as u16;
            let control_type = ControlType::try_from(raw_type)
                .map_err(|_| anyhow!("unsupported control type {}", raw_type))?;
            PacketKind::Control(control_type)
        };

        Ok(PacketHeader {
            kind,
            additional_info: buf.get_u32(),
            timestamp: buf.get_u32(),
            destination_socket_id: SocketId(buf.get_u32()),
        })
    }

    /// Extracts the routing information without parsing the rest of the packet
    pub fn peek_destination_socket_id(packet: &[u8]) -> Option<SocketId> {
        let raw = packet.get(12..Self::SERIALIZED_LEN)?;
        Some(SocketId(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ConnectionType {
    Request = 1,
    Response = -1,
}

/// The datagram a peer sends to announce its logical socket id, and the answer to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakePacket {
    pub destination_socket_id: SocketId,
    pub timestamp: u32,
    pub initial_sequence_number: u32,
    pub maximum_packet_size: u32,
    pub maximum_flow_window_size: u32,
    pub connection_type: ConnectionType,
    pub socket_id: SocketId,
    pub syn_cookie: u32,
    pub ip_address: IpAddr,
}

impl HandshakePacket {
    pub const VERSION: u32 = 4;
    pub const SOCKET_TYPE_STREAM: u32 = 1;
    pub const SERIALIZED_LEN: usize = PacketHeader::SERIALIZED_LEN + 8 * size_of::<u32>() + size_of::<u128>();

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        PacketHeader::control(ControlType::Handshake, self.timestamp, self.destination_socket_id)
            .ser(buf);

        buf.put_u32(Self::VERSION);
        buf.put_u32(Self::SOCKET_TYPE_STREAM);
        buf.put_u32(self.initial_sequence_number);
        buf.put_u32(self.maximum_packet_size);
        buf.put_u32(self.maximum_flow_window_size);
        buf.put_i32(self.connection_type.into());
        buf.put_u32(self.socket_id.0);
        buf.put_u32(self.syn_cookie);

        let ip = match self.ip_address {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        buf.put_u128(ip.to_bits());
    }

    /// Returns `None` for anything that is not a well-formed handshake. Arbitrary datagrams can
    ///  arrive from the network, so callers are expected to drop those rather than fail.
    pub fn decode(packet: &[u8]) -> Option<HandshakePacket> {
        match Self::deser(&mut &packet[..]) {
            Ok(handshake) => Some(handshake),
            Err(e) => {
                trace!("not a valid handshake packet: {}", e);
                None
            }
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakePacket> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet is shorter than a handshake: {} < {} bytes", buf.remaining(), Self::SERIALIZED_LEN);
        }

        let header = PacketHeader::deser(buf)?;
        if header.kind != PacketKind::Control(ControlType::Handshake) {
            bail!("packet is not a handshake: {:?}", header.kind);
        }

        let version = buf.get_u32();
        if version != Self::VERSION {
            bail!("unsupported handshake version {}", version);
        }
        let socket_type = buf.get_u32();
        if socket_type != Self::SOCKET_TYPE_STREAM {
            bail!("unsupported socket type {}", socket_type);
        }

        let initial_sequence_number = buf.get_u32();
        let maximum_packet_size = buf.get_u32();
        let maximum_flow_window_size = buf.get_u32();
        let raw_connection_type = buf.get_i32();
        let connection_type = ConnectionType::try_from(raw_connection_type)
            .map_err(|_| anyhow!("invalid connection type {}", raw_connection_type))?;
        let socket_id = SocketId(buf.get_u32());
        let syn_cookie = buf.get_u32();

        let ip = Ipv6Addr::from_bits(buf.get_u128());
        let ip_address = match ip.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(ip),
        };

        Ok(HandshakePacket {
            destination_socket_id: header.destination_socket_id,
            timestamp: header.timestamp,
            initial_sequence_number,
            maximum_packet_size,
            maximum_flow_window_size,
            connection_type,
            socket_id,
            syn_cookie,
            ip_address,
        })
    }
}
