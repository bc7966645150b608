//! Reliable, message-oriented transport on top of UDP, used as the communication layer of a
//!  DHT-style peer-to-peer overlay.
//!
//! ## Structure
//!
//! * A [multiplexer::Multiplexer] owns the single UDP socket of a local endpoint. Every inbound
//!   datagram carries the *logical socket id* of its destination, and the multiplexer routes it
//!   either to the socket registered under that id or to the currently registered
//!   [acceptor::Acceptor].
//! * The acceptor turns unsolicited handshake datagrams into accepted sockets. It holds a backlog
//!   of handshakes nobody accepted yet, and at most one waiting `accept` call.
//! * A [connection::Connection] layers length-prefixed message framing, request / response
//!   sequencing and timeout supervision over one reliable stream socket.
//! * [transport::UdtTransport] ties the parts together and talks to the application through
//!   [transport::MessageHandler].
//!
//! ## Message framing
//!
//! On top of the stream socket, every message is sent as
//!
//! ```ascii
//! 0: payload length N (u32 BE)
//! 4: N bytes of payload
//! ```
//!
//! There is no other header at this layer, identification and sequencing are done by the socket.
//!
//! ## Conversation
//!
//! A connection carries a single conversation: the initiator connects, writes a request and
//!  (optionally) waits for a response. The receiver hands the request to the application, which
//!  may return a response. Either side closes as soon as no further message is expected - there
//!  is no keep-alive.
//!
//! Cancellation is done by closing the stream socket: every pending read / write / connect on a
//!  closed socket completes with an error, and the connection classifies that as a timeout.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod message_header;
pub mod multiplexer;
pub mod packet;
#[cfg(test)] pub mod test_util;
pub mod transport;
pub mod udt_socket;
