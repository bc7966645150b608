use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use anyhow::{anyhow, bail};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use crate::multiplexer::Multiplexer;
use crate::packet::{ConnectionType, HandshakePacket, SocketId};
use crate::udt_socket::{StreamSocket, UdtSocket};

/// A handshake that arrived while nobody was waiting in `accept`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub remote_id: SocketId,
    pub remote_endpoint: SocketAddr,
    pub initial_sequence_number: u32,
}

struct WaitingAccept {
    socket: Arc<UdtSocket>,
    completion: oneshot::Sender<()>,
}

/// Invariant: either the backlog is empty or there is no waiting accept (or both)
struct AcceptorState {
    waiting: Option<WaitingAccept>,
    backlog: VecDeque<PendingRequest>,
}

/// The acceptor turns unsolicited handshake datagrams into accepted sockets.
///
/// Handshakes that arrive while no `accept` call is waiting are queued in a backlog and serviced
///  in arrival order. There can be at most one waiting `accept` call at a time.
///
/// The acceptor registers itself with the multiplexer on creation, and deregisters when it is
///  closed or dropped. It does not keep the multiplexer alive.
pub struct Acceptor {
    multiplexer: Weak<Multiplexer>,
    max_backlog: usize,
    state: Mutex<AcceptorState>,
}

impl Acceptor {
    /// Fails if the multiplexer has a (live) acceptor registered already
    pub fn new(multiplexer: &Arc<Multiplexer>) -> anyhow::Result<Arc<Acceptor>> {
        let acceptor = Arc::new(Acceptor {
            multiplexer: Arc::downgrade(multiplexer),
            max_backlog: multiplexer.config().max_accept_backlog,
            state: Mutex::new(AcceptorState {
                waiting: None,
                backlog: VecDeque::new(),
            }),
        });
        multiplexer.dispatcher().set_acceptor(Arc::downgrade(&acceptor))?;
        Ok(acceptor)
    }

    fn lock(&self) -> MutexGuard<'_, AcceptorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// true iff this is the multiplexer's currently registered acceptor
    pub fn is_open(&self) -> bool {
        self.multiplexer.upgrade()
            .map(|m| m.dispatcher().is_acceptor(self))
            .unwrap_or(false)
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().waiting
            .as_ref()
            .map(|w| !w.completion.is_closed())
            .unwrap_or(false)
    }

    /// Discards the backlog, cancels a waiting `accept` and deregisters from the multiplexer
    pub fn close(&self) {
        debug!("closing acceptor");
        let cancelled = {
            let mut state = self.lock();
            state.backlog.clear();
            state.waiting.take()
        };
        // dropping the completion makes the waiting accept fail
        drop(cancelled);

        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.dispatcher().clear_acceptor(self);
        }
    }

    /// Binds the socket to the oldest pending handshake if there is one, or waits for the next
    ///  handshake to arrive. On success, the socket is registered with the multiplexer and knows
    ///  its peer.
    ///
    /// Fails if another accept is in progress on this acceptor, or if the acceptor is closed
    ///  (including while waiting).
    pub async fn accept(&self, socket: &Arc<UdtSocket>) -> anyhow::Result<()> {
        let multiplexer = self.multiplexer.upgrade()
            .ok_or_else(|| anyhow!("multiplexer was shut down"))?;

        let completion = {
            let mut state = self.lock();

            if let Some(waiting) = &state.waiting {
                // the slot of an abandoned accept can be reused
                if !waiting.completion.is_closed() {
                    bail!("only one accept operation at a time");
                }
            }
            if !self.is_open() {
                bail!("acceptor is closed");
            }

            if let Some(request) = state.backlog.pop_front() {
                trace!("accepting pending request from {:?}", request.remote_endpoint);
                Self::bind(&multiplexer, socket, &request);
                state.waiting = None;
                return Ok(());
            }

            let (completion, waiting_for) = oneshot::channel();
            state.waiting = Some(WaitingAccept {
                socket: socket.clone(),
                completion,
            });
            waiting_for
        };

        trace!("waiting for handshake");
        completion.await
            .map_err(|_| anyhow!("accept was cancelled"))
    }

    /// Called by the multiplexer for datagrams that are not addressed to a registered socket
    pub fn handle_receive_from(&self, packet: &[u8], from: SocketAddr) {
        let Some(handshake) = HandshakePacket::decode(packet) else {
            warn!("acceptor ignoring invalid packet from {:?}", from);
            return;
        };
        if handshake.connection_type != ConnectionType::Request {
            debug!("acceptor ignoring handshake response from {:?}", from);
            return;
        }

        let request = PendingRequest {
            remote_id: handshake.socket_id,
            remote_endpoint: from,
            initial_sequence_number: handshake.initial_sequence_number,
        };

        let mut state = self.lock();
        if let Some(waiting) = state.waiting.take() {
            if !waiting.completion.is_closed() {
                if let Some(multiplexer) = self.multiplexer.upgrade() {
                    // a socket is waiting to accept the new connection
                    if Self::hand_over(&multiplexer, waiting, &request) {
                        return;
                    }
                }
            }
        }

        if state.backlog.iter().any(|r| r.remote_endpoint == from && r.remote_id == request.remote_id) {
            debug!("ignoring repeated handshake from {:?}", from);
            return;
        }

        // there's no socket waiting, queue it for later
        if state.backlog.len() >= self.max_backlog {
            if let Some(dropped) = state.backlog.pop_front() {
                warn!("accept backlog is full - dropping oldest pending request from {:?}", dropped.remote_endpoint);
            }
        }
        trace!("queueing handshake from {:?}", from);
        state.backlog.push_back(request);
    }

    /// Binds the waiting socket and completes its accept. Returns false if the accept was
    ///  abandoned in the meantime, leaving the request to the caller.
    fn hand_over(multiplexer: &Multiplexer, waiting: WaitingAccept, request: &PendingRequest) -> bool {
        Self::bind(multiplexer, &waiting.socket, request);
        if waiting.completion.send(()).is_ok() {
            return true;
        }
        debug!("accept was abandoned while binding - releasing the socket");
        waiting.socket.close();
        false
    }

    fn bind(multiplexer: &Multiplexer, socket: &Arc<UdtSocket>, request: &PendingRequest) {
        let id = multiplexer.dispatcher().add_socket(UdtSocket::as_sink(socket));
        socket.bind_accepted(id, request);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.dispatcher().clear_acceptor(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::{always, eq};
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::multiplexer::MockDatagramSocket;
    use crate::test_util::{handshake_request, test_config};

    fn multiplexer() -> Arc<Multiplexer> {
        Multiplexer::new(Arc::new(MockDatagramSocket::new()), Arc::new(test_config()))
    }

    fn peer(n: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], n))
    }

    fn send_handshake(acceptor: &Acceptor, n: u16) {
        acceptor.handle_receive_from(&handshake_request(SocketId::NONE, SocketId(1000 + n as u32)).encode(), peer(n));
    }

    fn rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap()
    }

    #[rstest]
    #[case::none(0, 0)]
    #[case::more_handshakes(3, 1)]
    #[case::equal(2, 2)]
    #[case::more_accepts(1, 3)]
    #[case::only_accepts(0, 2)]
    fn test_backlog_fifo(#[case] num_handshakes: u16, #[case] num_accepts: usize) {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        for n in 0..num_handshakes {
            send_handshake(&acceptor, n);
        }

        rt().block_on(async {
            let mut accepted = Vec::new();
            let mut suspended = 0;
            for _ in 0..num_accepts {
                let socket = UdtSocket::new(&multiplexer);
                let accept = acceptor.accept(&socket);
                match tokio::time::timeout(Duration::from_millis(10), accept).await {
                    Ok(r) => {
                        r.unwrap();
                        accepted.push(socket);
                    }
                    Err(_) => suspended += 1,
                }
            }

            let expected_accepted = num_accepts.min(num_handshakes as usize);
            assert_eq!(accepted.len(), expected_accepted);
            for (n, socket) in accepted.iter().enumerate() {
                assert_eq!(socket.remote_endpoint(), Some(peer(n as u16)));
                assert_eq!(socket.remote_id(), Some(SocketId(1000 + n as u32)));
                let id = socket.id().unwrap();
                assert!(multiplexer.dispatcher().socket(id).is_some());
            }
            assert_eq!(acceptor.backlog_len(), num_handshakes as usize - expected_accepted);
            assert_eq!(suspended, num_accepts - expected_accepted);
        });
    }

    #[test]
    fn test_waiting_accept_completes_on_handshake() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        rt().block_on(async {
            let socket = UdtSocket::new(&multiplexer);
            let accept_acceptor = acceptor.clone();
            let accept_socket = socket.clone();
            let accept = tokio::spawn(async move { accept_acceptor.accept(&accept_socket).await });

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(acceptor.is_accepting());

            send_handshake(&acceptor, 7);
            accept.await.unwrap().unwrap();

            assert!(!acceptor.is_accepting());
            assert_eq!(acceptor.backlog_len(), 0);
            assert_eq!(socket.remote_endpoint(), Some(peer(7)));
            assert_eq!(socket.remote_id(), Some(SocketId(1007)));
        });
    }

    #[test]
    fn test_second_concurrent_accept_rejected() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        rt().block_on(async {
            let first_acceptor = acceptor.clone();
            let first_socket = UdtSocket::new(&multiplexer);
            let first = tokio::spawn(async move { first_acceptor.accept(&first_socket).await });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let second = acceptor.accept(&UdtSocket::new(&multiplexer)).await;
            assert!(second.is_err());

            // the first accept is unaffected
            send_handshake(&acceptor, 1);
            first.await.unwrap().unwrap();
        });
    }

    #[test]
    fn test_abandoned_accept_slot_is_reused() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        rt().block_on(async {
            let abandoned = UdtSocket::new(&multiplexer);
            assert!(tokio::time::timeout(Duration::from_millis(10), acceptor.accept(&abandoned)).await.is_err());
            assert!(!acceptor.is_accepting());

            // the handshake must not be bound to the abandoned socket
            send_handshake(&acceptor, 3);
            assert_eq!(acceptor.backlog_len(), 1);
            assert_eq!(abandoned.remote_endpoint(), None);

            let socket = UdtSocket::new(&multiplexer);
            acceptor.accept(&socket).await.unwrap();
            assert_eq!(socket.remote_endpoint(), Some(peer(3)));
        });
    }

    #[test]
    fn test_close_cancels_waiting_accept() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        rt().block_on(async {
            let accept_acceptor = acceptor.clone();
            let accept = tokio::spawn(async move {
                let socket = UdtSocket::new(&accept_acceptor.multiplexer.upgrade().unwrap());
                accept_acceptor.accept(&socket).await
            });
            tokio::time::sleep(Duration::from_millis(10)).await;

            acceptor.close();
            assert!(accept.await.unwrap().is_err());
            assert!(!acceptor.is_open());
            assert!(multiplexer.dispatcher().acceptor().is_none());

            // accepting on a closed acceptor fails right away
            assert!(acceptor.accept(&UdtSocket::new(&multiplexer)).await.is_err());
        });
    }

    #[test]
    fn test_close_clears_backlog() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();
        send_handshake(&acceptor, 1);
        send_handshake(&acceptor, 2);

        acceptor.close();
        assert_eq!(acceptor.backlog_len(), 0);
    }

    #[rstest]
    #[case::garbage(vec![1,2,3])]
    #[case::data_packet(crate::test_util::data_packet(SocketId::NONE, 0, b"abc"))]
    #[case::handshake_response({
        let mut handshake = handshake_request(SocketId::NONE, SocketId(5));
        handshake.connection_type = ConnectionType::Response;
        handshake.encode().to_vec()
    })]
    fn test_invalid_packets_ignored(#[case] packet: Vec<u8>) {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        acceptor.handle_receive_from(&packet, peer(1));
        assert_eq!(acceptor.backlog_len(), 0);
    }

    #[test]
    fn test_backlog_drops_oldest_when_full() {
        let mut config = test_config();
        config.max_accept_backlog = 2;
        let multiplexer = Multiplexer::new(Arc::new(MockDatagramSocket::new()), Arc::new(config));
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        for n in 1..=3 {
            send_handshake(&acceptor, n);
        }
        assert_eq!(acceptor.backlog_len(), 2);

        rt().block_on(async {
            let socket = UdtSocket::new(&multiplexer);
            acceptor.accept(&socket).await.unwrap();
            assert_eq!(socket.remote_endpoint(), Some(peer(2)));
        });
    }

    #[test]
    fn test_accept_abandoned_while_binding() {
        // the released socket tells the peer that it is gone
        let mut socket = MockDatagramSocket::new();
        socket.expect_try_send_datagram()
            .with(eq(peer(1)), always())
            .times(1)
            .returning(|_, _| Ok(()));
        let multiplexer = Multiplexer::new(Arc::new(socket), Arc::new(test_config()));
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        let socket = UdtSocket::new(&multiplexer);
        let (completion, waiting_for) = oneshot::channel();
        drop(waiting_for);
        let request = PendingRequest {
            remote_id: SocketId(1001),
            remote_endpoint: peer(1),
            initial_sequence_number: 0,
        };

        assert!(!Acceptor::hand_over(&multiplexer, WaitingAccept { socket: socket.clone(), completion }, &request));
        assert!(!socket.is_open());
        assert!(multiplexer.dispatcher().socket(socket.id().unwrap()).is_none());
        assert_eq!(multiplexer.dispatcher().num_sockets(), 0);

        // the request is still available to the next accept
        acceptor.handle_receive_from(&handshake_request(SocketId::NONE, SocketId(1001)).encode(), peer(1));
        assert_eq!(acceptor.backlog_len(), 1);
    }

    #[test]
    fn test_repeated_handshake_queued_once() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();

        send_handshake(&acceptor, 1);
        send_handshake(&acceptor, 1);
        send_handshake(&acceptor, 2);
        assert_eq!(acceptor.backlog_len(), 2);

        // a different remote socket on the same endpoint is a separate request
        acceptor.handle_receive_from(&handshake_request(SocketId::NONE, SocketId(77)).encode(), peer(1));
        assert_eq!(acceptor.backlog_len(), 3);
    }

    #[test]
    fn test_stale_acceptor_does_not_clear_registration() {
        let multiplexer = multiplexer();
        let first = Acceptor::new(&multiplexer).unwrap();
        first.close();
        let second = Acceptor::new(&multiplexer).unwrap();

        first.close();
        drop(first);
        assert!(second.is_open());
        assert!(multiplexer.dispatcher().is_acceptor(&second));
    }

    #[test]
    fn test_single_acceptor_per_multiplexer() {
        let multiplexer = multiplexer();
        let acceptor = Acceptor::new(&multiplexer).unwrap();
        assert!(acceptor.is_open());
        assert!(Acceptor::new(&multiplexer).is_err());

        acceptor.close();
        let second = Acceptor::new(&multiplexer).unwrap();
        assert!(second.is_open());
        assert!(!acceptor.is_open());

        drop(second);
        assert!(multiplexer.dispatcher().acceptor().is_none());
        assert!(Acceptor::new(&multiplexer).is_ok());
    }
}
