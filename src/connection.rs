use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;
use crate::config::{ResponseTimeout, TransportConfig};
use crate::message_header::{frame_message, MessageHeader};
use crate::udt_socket::StreamSocket;

/// The conditions a connection reports to its owner's error callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportCondition {
    MessageSizeTooLarge,
    SendTimeout,
    SendFailure,
    ReceiveTimeout,
    ReceiveFailure,
}

impl Display for TransportCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportCondition::MessageSizeTooLarge => "message size too large",
            TransportCondition::SendTimeout => "send timeout",
            TransportCondition::SendFailure => "send failure",
            TransportCondition::ReceiveTimeout => "receive timeout",
            TransportCondition::ReceiveFailure => "receive failure",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for TransportCondition {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Metadata passed to the application together with a received message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageInfo {
    pub remote_endpoint: Option<SocketAddr>,
}

/// A message the application wants to send back on the connection it received a message on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub payload: Vec<u8>,
    pub timeout: ResponseTimeout,
}

/// The connection's view of the transport that created it. Connections hold it weakly, so a
///  transport that went away simply ends their conversations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionOwner: Send + Sync + 'static {
    /// `None` or an empty payload means 'no response', which closes the connection
    async fn on_message_received(&self, message: Vec<u8>, info: MessageInfo) -> Option<Response>;

    fn on_error(&self, condition: TransportCondition);

    fn remove_connection(&self, id: ConnectionId);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Writing,
    AwaitingResponseSize,
    AwaitingResponseData,
    AwaitingRequestSize,
    AwaitingRequestData,
    Dispatching,
    Closed,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Send,
    Receive,
}

impl Phase {
    fn timeout(self) -> TransportCondition {
        match self {
            Phase::Send => TransportCondition::SendTimeout,
            Phase::Receive => TransportCondition::ReceiveTimeout,
        }
    }

    fn failure(self) -> TransportCondition {
        match self {
            Phase::Send => TransportCondition::SendFailure,
            Phase::Receive => TransportCondition::ReceiveFailure,
        }
    }
}

/// A connection runs a request/response conversation of length-prefixed messages on a single
///  stream socket: it sends and / or receives a message, hands received messages to its owner,
///  and sends the owner's response back, until either side has nothing more to say.
///
/// All operations of a connection run sequentially on a single task. Timeouts are enforced by a
///  watchdog task that closes the socket when the current deadline passes, which makes the
///  pending socket operation fail. A failure on a closed socket is therefore reported as a
///  timeout.
///
/// NB: While a received message is being handled by the owner, no timeout applies.
pub struct Connection {
    id: ConnectionId,
    correlation_id: Uuid,
    owner: Weak<dyn ConnectionOwner>,
    socket: Arc<dyn StreamSocket>,
    remote_endpoint: SocketAddr,
    config: Arc<TransportConfig>,
    state: Mutex<ConnectionState>,
    deadline: watch::Sender<Option<Instant>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(id: ConnectionId, owner: Weak<dyn ConnectionOwner>, socket: Arc<dyn StreamSocket>, remote_endpoint: SocketAddr, config: Arc<TransportConfig>) -> Arc<Connection> {
        let (deadline, _) = watch::channel(None);
        Arc::new(Connection {
            id,
            correlation_id: Uuid::new_v4(),
            owner,
            socket,
            remote_endpoint,
            config,
            state: Mutex::new(ConnectionState::Idle),
            deadline,
            watchdog: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.lock_state();
        // a concurrent close wins
        if *current != ConnectionState::Closed {
            trace!("{:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn span(&self) -> Span {
        span!(Level::DEBUG, "connection", correlation_id = ?self.correlation_id, remote = ?self.remote_endpoint)
    }

    /// Starts the conversation of an accepted connection: it waits for a request from the peer.
    pub fn start_receiving(self: &Arc<Self>) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            connection.start_watchdog();
            connection.converse(None, ResponseTimeout::After(connection.config.default_initial_timeout)).await;
        }.instrument(self.span()))
    }

    /// Starts the conversation of an outgoing connection: it connects to the peer and sends the
    ///  message. A message exceeding the size limit is reported as [TransportCondition::MessageSizeTooLarge]
    ///  without anything being written.
    pub fn start_sending(self: &Arc<Self>, message: &[u8], response_timeout: ResponseTimeout) -> JoinHandle<()> {
        let framed = frame_message(message, self.config.max_message_size);
        let connection = self.clone();
        tokio::spawn(async move {
            let framed = match framed {
                Ok(framed) => framed,
                Err(e) => {
                    warn!("not sending message: {}", e);
                    connection.close_on_error(TransportCondition::MessageSizeTooLarge);
                    return;
                }
            };

            connection.start_watchdog();
            if let Err(condition) = connection.connect().await {
                connection.close_on_error(condition);
                return;
            }
            connection.converse(Some(framed), response_timeout).await;
        }.instrument(self.span()))
    }

    /// Closes the connection without reporting an error. This is idempotent, and a conversation
    ///  that is in progress ends without reporting an error either.
    pub fn close(&self) {
        let previous = {
            let mut state = self.lock_state();
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        if previous == ConnectionState::Closed {
            return;
        }
        debug!("closing connection {:?} in state {:?}", self.id, previous);

        if let Some(watchdog) = self.watchdog.lock().unwrap_or_else(|e| e.into_inner()).take() {
            watchdog.abort();
        }
        self.socket.close();
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_connection(self.id);
        }
    }

    fn close_on_error(&self, condition: TransportCondition) {
        if self.state() == ConnectionState::Closed {
            debug!("connection was closed - not reporting {}", condition);
            return;
        }

        debug!("closing connection {:?}: {}", self.id, condition);
        if let Some(owner) = self.owner.upgrade() {
            owner.on_error(condition);
        }
        self.close();
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadline.send_replace(deadline);
    }

    /// There is a single watchdog per connection. It waits for the current deadline, and is
    ///  re-armed whenever the deadline changes.
    fn start_watchdog(&self) {
        let socket = self.socket.clone();
        let mut deadline = self.deadline.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if !socket.is_open() {
                    return;
                }

                let current = *deadline.borrow_and_update();
                match current {
                    Some(at) if at <= Instant::now() => {
                        debug!("timeout - closing socket");
                        socket.close();
                        return;
                    }
                    Some(at) => {
                        select! {
                            _ = sleep_until(at) => {}
                            r = deadline.changed() => {
                                if r.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if deadline.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        }.in_current_span());

        *self.watchdog.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// NB: Socket operations are only attempted on an open socket. An operation failing on a
    ///      socket that was closed in the meantime was cancelled by the watchdog.
    fn ensure_open(&self, phase: Phase) -> Result<(), TransportCondition> {
        if self.socket.is_open() {
            Ok(())
        }
        else {
            Err(phase.timeout())
        }
    }

    fn classify<T>(&self, result: anyhow::Result<T>, phase: Phase) -> Result<T, TransportCondition> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if !self.socket.is_open() => {
                debug!("socket was closed during {:?}: {}", phase, e);
                Err(phase.timeout())
            }
            Err(e) => {
                debug!("I/O error during {:?}: {}", phase, e);
                Err(phase.failure())
            }
        }
    }

    async fn connect(&self) -> Result<(), TransportCondition> {
        self.ensure_open(Phase::Send)?;
        self.set_state(ConnectionState::Connecting);
        self.set_deadline(Some(Instant::now() + self.config.default_initial_timeout));

        let result = self.socket.connect(self.remote_endpoint).await;
        self.classify(result, Phase::Send)
    }

    async fn converse(&self, mut outgoing: Option<BytesMut>, mut response_timeout: ResponseTimeout) {
        let mut awaiting_request = outgoing.is_none();

        loop {
            if let Some(framed) = outgoing.take() {
                if let Err(condition) = self.write(&framed).await {
                    return self.close_on_error(condition);
                }
            }

            let timeout = match response_timeout {
                ResponseTimeout::Immediate => {
                    trace!("no response expected");
                    return self.close();
                }
                ResponseTimeout::After(timeout) => timeout,
            };

            let message = match self.read_message(timeout, awaiting_request).await {
                Ok(message) => message,
                Err(condition) => return self.close_on_error(condition),
            };
            awaiting_request = false;

            let Some(response) = self.dispatch(message).await else {
                trace!("no response - closing");
                return self.close();
            };

            match frame_message(&response.payload, self.config.max_message_size) {
                Ok(framed) => outgoing = Some(framed),
                Err(e) => {
                    warn!("not sending response: {}", e);
                    return self.close_on_error(TransportCondition::MessageSizeTooLarge);
                }
            }
            response_timeout = response.timeout;
        }
    }

    async fn write(&self, framed: &[u8]) -> Result<(), TransportCondition> {
        self.ensure_open(Phase::Send)?;
        self.set_state(ConnectionState::Writing);
        self.set_deadline(Some(Instant::now() + self.config.write_timeout(framed.len())));

        let result = self.socket.write(framed).await;
        self.classify(result, Phase::Send)
    }

    /// The deadline of every read step is the earlier of the response deadline (fixed when
    ///  reading starts) and the stall deadline (relative to the start of the read step).
    fn read_deadline(&self, response_deadline: Instant) -> Instant {
        response_deadline.min(Instant::now() + self.config.stall_timeout)
    }

    async fn read_message(&self, response_timeout: Duration, awaiting_request: bool) -> Result<Vec<u8>, TransportCondition> {
        let (size_state, data_state) = if awaiting_request {
            (ConnectionState::AwaitingRequestSize, ConnectionState::AwaitingRequestData)
        }
        else {
            (ConnectionState::AwaitingResponseSize, ConnectionState::AwaitingResponseData)
        };

        self.ensure_open(Phase::Receive)?;
        self.set_state(size_state);
        let response_deadline = Instant::now() + response_timeout;
        self.set_deadline(Some(self.read_deadline(response_deadline)));

        let mut header_buf = [0u8; MessageHeader::SERIALIZED_LEN];
        let result = self.socket.read(&mut header_buf, MessageHeader::SERIALIZED_LEN).await;
        let n = self.classify(result, Phase::Receive)?;
        let header = match MessageHeader::deser(&mut &header_buf[..n]) {
            Ok(header) => header,
            Err(e) => {
                warn!("{}", e);
                return Err(TransportCondition::ReceiveFailure);
            }
        };
        if let Err(e) = header.validate(self.config.max_message_size) {
            warn!("{}", e);
            return Err(TransportCondition::ReceiveFailure);
        }

        let message_len = header.payload_len();
        trace!("receiving message of {} bytes", message_len);
        self.set_state(data_state);

        // the buffer grows chunk by chunk, so a peer can not make us allocate memory for data it
        //  does not actually send
        let mut buf = Vec::new();
        while buf.len() < message_len {
            self.ensure_open(Phase::Receive)?;

            let offset = buf.len();
            let chunk_len = self.config.max_chunk_size.min(message_len - offset);
            buf.resize(offset + chunk_len, 0);

            self.set_deadline(Some(self.read_deadline(response_deadline)));
            let result = self.socket.read(&mut buf[offset..], 1).await;
            let n = self.classify(result, Phase::Receive)?;
            if n == 0 {
                warn!("socket returned no data");
                return Err(TransportCondition::ReceiveFailure);
            }
            buf.truncate(offset + n);
        }
        Ok(buf)
    }

    /// Hands the message to the owner on a separate task, so that the owner's code is neither
    ///  subject to timeouts nor able to bring down the connection's task.
    async fn dispatch(&self, message: Vec<u8>) -> Option<Response> {
        self.set_state(ConnectionState::Dispatching);
        self.set_deadline(None);

        let owner = self.owner.upgrade()?;
        let info = MessageInfo {
            remote_endpoint: Some(self.remote_endpoint),
        };

        let handler = tokio::spawn(async move {
            owner.on_message_received(message, info).await
        }.in_current_span());

        match handler.await {
            Ok(response) => response.filter(|r| !r.payload.is_empty()),
            Err(e) => {
                error!("message handler failed: {}", e);
                None
            }
        }
    }
}
