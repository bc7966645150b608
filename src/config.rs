use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// The address the multiplexer's UDP socket binds to.
    pub self_addr: SocketAddr,

    /// Upper bound for the payload of a single framed message, in both directions. Sending a
    ///  bigger message is rejected locally; receiving a length header announcing a bigger message
    ///  fails the connection before any buffer space is allocated for it.
    pub max_message_size: u32,

    /// Receive-side chunking: a single read operation asks for at most this many bytes. The
    ///  receive buffer grows by at most this much per read, regardless of what the peer declared.
    pub max_chunk_size: usize,

    /// Timeout for connecting, and the initial response deadline for an incoming request.
    pub default_initial_timeout: Duration,

    /// Lower bound for the (size dependent) write timeout.
    pub min_write_timeout: Duration,

    /// Maximum time without progress on a single read step.
    pub stall_timeout: Duration,

    /// Time budget per byte for writing a framed message. The effective write timeout is
    ///  `max(len * write_timeout_per_byte, min_write_timeout)`, so big messages are not starved
    ///  by a fixed deadline.
    pub write_timeout_per_byte: Duration,

    /// This is the payload size inside UDP packets. The stream socket never sends datagrams that
    ///  are bigger, so this must be supported by all routes between nodes. With full Ethernet
    ///  frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for IPV4 and
    ///  `1500 - 40 - 8 = 1452` for IPV6.
    pub max_datagram_size: usize,

    /// Maximum number of handshakes queued in the acceptor's backlog. When the backlog is full,
    ///  the oldest pending request is dropped.
    pub max_accept_backlog: usize,

    /// Upper bound for the data a stream socket holds on behalf of its reader, counting both
    ///  reassembled bytes and packets buffered ahead of a gap. Data packets that would exceed it
    ///  are dropped as if they were lost on the network. This also limits how far ahead of the
    ///  expected sequence number packets are buffered.
    pub max_receive_buffer: usize,
}

impl TransportConfig {
    /// Defaults for IPV4 with end-to-end full Ethernet MTU, without optional headers
    pub fn default_ipv4(self_addr: SocketAddr) -> TransportConfig {
        TransportConfig {
            self_addr,
            max_message_size: 64 * 1024 * 1024,
            max_chunk_size: 64 * 1024,
            default_initial_timeout: Duration::from_secs(10),
            min_write_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(3),
            write_timeout_per_byte: Duration::from_micros(10),
            max_datagram_size: 1472,
            max_accept_backlog: 128,
            max_receive_buffer: 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size < 100 {
            bail!("datagram size is too small");
        }
        if self.max_chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.max_message_size > u32::MAX - 4 {
            bail!("maximum message size must leave room for the length header");
        }
        if self.max_accept_backlog == 0 {
            bail!("accept backlog must hold at least one request");
        }
        if self.max_receive_buffer < self.max_datagram_size {
            bail!("receive buffer must hold at least one datagram");
        }
        Ok(())
    }

    /// The time allowed for writing a framed message of the given total length.
    pub fn write_timeout(&self, framed_len: usize) -> Duration {
        let scaled = self.write_timeout_per_byte
            .saturating_mul(u32::try_from(framed_len).unwrap_or(u32::MAX));
        scaled.max(self.min_write_timeout)
    }
}

/// Governs what happens after a message is written: either the connection closes right away,
///  or it waits (up to the given time) for a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseTimeout {
    Immediate,
    After(Duration),
}
