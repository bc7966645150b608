use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::acceptor::Acceptor;
use crate::packet::SocketId;

/// Anything the multiplexer can route a datagram to.
///
/// NB: This is called on the multiplexer's receive loop for every datagram, so implementations
///      must hand the data off rather than doing I/O
pub trait DatagramSink: Send + Sync + 'static {
    fn handle_datagram(&self, packet: &[u8], from: SocketAddr);
}

struct DispatcherInner {
    /// The table does not own the sockets: they register and deregister themselves
    sockets: FxHashMap<SocketId, Weak<dyn DatagramSink>>,
    acceptor: Option<Weak<Acceptor>>,
    next_id: u32,
}

impl DispatcherInner {
    fn allocate_id(&mut self) -> SocketId {
        loop {
            let candidate = SocketId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);

            if candidate != SocketId::NONE && !self.sockets.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// The dispatch table of a multiplexer: logical socket id -> socket, plus a single slot for the
///  current acceptor.
///
/// Sockets register and deregister from arbitrary tasks while the receive loop looks them up for
///  every datagram, so all access goes through a lock. Critical sections never await.
pub struct Dispatcher {
    inner: RwLock<DispatcherInner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        // random starting point so that a restarted node does not immediately hand out the same
        //  ids as its previous incarnation
        Self::with_first_id(rand::random())
    }

    fn with_first_id(next_id: u32) -> Dispatcher {
        Dispatcher {
            inner: RwLock::new(DispatcherInner {
                sockets: FxHashMap::default(),
                acceptor: None,
                next_id,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DispatcherInner> {
        // the table stays consistent even if a panic happened while the lock was held
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DispatcherInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Assigns a fresh id that is unique among currently registered sockets
    pub fn add_socket(&self, socket: Weak<dyn DatagramSink>) -> SocketId {
        let mut inner = self.write();
        let id = inner.allocate_id();
        inner.sockets.insert(id, socket);
        trace!("registered socket {:?}", id);
        id
    }

    pub fn remove_socket(&self, id: SocketId) {
        if self.write().sockets.remove(&id).is_some() {
            trace!("deregistered socket {:?}", id);
        }
    }

    pub fn socket(&self, id: SocketId) -> Option<Arc<dyn DatagramSink>> {
        self.read().sockets
            .get(&id)
            .and_then(|s| s.upgrade())
    }

    pub fn num_sockets(&self) -> usize {
        self.read().sockets.len()
    }

    /// There can be only one acceptor at a time - the previous acceptor must be closed (or
    ///  dropped) before a new one is registered.
    pub fn set_acceptor(&self, acceptor: Weak<Acceptor>) -> anyhow::Result<()> {
        let mut inner = self.write();
        if inner.acceptor.as_ref().and_then(|a| a.upgrade()).is_some() {
            bail!("an acceptor is already registered - close it before registering a new one");
        }
        debug!("registered acceptor");
        inner.acceptor = Some(acceptor);
        Ok(())
    }

    pub fn acceptor(&self) -> Option<Arc<Acceptor>> {
        self.read().acceptor
            .as_ref()
            .and_then(|a| a.upgrade())
    }

    pub fn is_acceptor(&self, acceptor: &Acceptor) -> bool {
        self.read().acceptor
            .as_ref()
            .map(|a| std::ptr::eq(a.as_ptr(), acceptor))
            .unwrap_or(false)
    }

    /// Clears the acceptor slot if (and only if) it holds the given acceptor
    pub fn clear_acceptor(&self, acceptor: &Acceptor) {
        let mut inner = self.write();
        if inner.acceptor.as_ref().map(|a| std::ptr::eq(a.as_ptr(), acceptor)).unwrap_or(false) {
            debug!("deregistered acceptor");
            inner.acceptor = None;
        }
    }
}
