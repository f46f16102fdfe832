//! Registry of live connections, shared by the accept loop and every session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Identity of an accepted connection.
pub type ConnectionId = u64;

struct SessionHandle {
    peer: SocketAddr,
    abort: AbortHandle,
}

/// Live connections keyed by id, behind a single lock.
///
/// A session task owns its socket; aborting the task drops the socket,
/// which is how `close_all` closes connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ConnectionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionHandle>> {
        // A panicking session cannot leave the map half-updated
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection from `peer` and start its session.
    ///
    /// `spawn` runs with the lock held, so a session that finishes at once
    /// still deregisters after it was registered.
    pub fn register<F>(&self, peer: SocketAddr, spawn: F) -> ConnectionId
    where
        F: FnOnce(ConnectionId) -> JoinHandle<()>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.lock();
        let task = spawn(id);
        sessions.insert(
            id,
            SessionHandle {
                peer,
                abort: task.abort_handle(),
            },
        );
        debug!(conn = id, peer = %peer, live = sessions.len(), "Registered connection");
        id
    }

    /// Forget a connection. Returns false if it was not registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut sessions = self.lock();
        match sessions.remove(&id) {
            Some(handle) => {
                debug!(conn = id, peer = %handle.peer, live = sessions.len(), "Deregistered connection");
                true
            }
            None => false,
        }
    }

    /// Close every registered connection and empty the registry.
    ///
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let mut sessions = self.lock();
        let count = sessions.len();
        for (id, handle) in sessions.drain() {
            debug!(conn = id, peer = %handle.peer, "Closing connection");
            handle.abort.abort();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }
}
