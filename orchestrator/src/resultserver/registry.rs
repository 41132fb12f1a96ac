use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    peer: SocketAddr,
    cancel: CancellationToken,
}

/// Live connection handlers, used to broadcast a stop request
///
/// Every handler token is a child of the registry's parent token, so a
/// handler registered after the stop broadcast starts out cancelled.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<Mutex<HashMap<u64, Entry>>>,
    next_id: Arc<AtomicU64>,
    parent: CancellationToken,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose handlers are cancelled together with `parent`.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new handler until the returned registration is dropped.
    pub fn register(&self, peer: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.parent.child_token();
        self.entries().insert(
            id,
            Entry {
                peer,
                cancel: cancel.clone(),
            },
        );
        Registration {
            id,
            cancel,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.entries().values().map(|e| e.peer).collect()
    }

    /// Handlers serving connections from `ip`.
    pub fn count_for(&self, ip: IpAddr) -> usize {
        self.entries().values().filter(|e| e.peer.ip() == ip).count()
    }

    /// Ask every handler, present and future, to stop. Handlers remove
    /// themselves on exit.
    pub fn cancel_all(&self) {
        self.parent.cancel();
    }

    fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }
}

/// Registry slot owned by one handler
#[derive(Debug)]
pub struct Registration {
    id: u64,
    cancel: CancellationToken,
    registry: HandlerRegistry,
}

impl Registration {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
