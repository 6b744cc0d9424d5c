use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a proxied connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    Accepted,
    Authenticating,
    ConnectingUpstream,
    Tunneling,
    RelayingHttp,
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Every path starting at `Accepted` ends in `Closed`, either directly
    /// (rejected, failed) or through one of the forwarding states.
    pub fn can_advance_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Accepted, Authenticating)
                | (Accepted, ConnectingUpstream)
                | (Authenticating, ConnectingUpstream)
                | (ConnectingUpstream, Tunneling)
                | (ConnectingUpstream, RelayingHttp)
                | (Accepted | Authenticating | ConnectingUpstream, Closed)
                | (Tunneling | RelayingHttp, Closed)
        )
    }
}

struct Entry {
    peer: SocketAddr,
    state: ConnState,
    token: CancellationToken,
}

/// The set of open connections owned by one server.
pub(crate) struct Registry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
    active: watch::Sender<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            active: watch::Sender::new(0),
        }
    }
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a freshly accepted connection.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let len = {
            let mut entries = self.lock();
            entries.insert(
                id,
                Entry {
                    peer,
                    state: ConnState::Accepted,
                    token: token.clone(),
                },
            );
            entries.len()
        };
        self.active.send_replace(len);

        Arc::new(Connection {
            id,
            peer,
            token,
            registry: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn states(&self) -> Vec<(SocketAddr, ConnState)> {
        self.lock()
            .values()
            .map(|entry| (entry.peer, entry.state))
            .collect()
    }

    /// Cancel every registered connection. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        // Tokens are collected first so that no connection is torn down while
        // the map is locked.
        let tokens: Vec<_> = self
            .lock()
            .values()
            .map(|entry| entry.token.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Wait until the registry is empty or `deadline` elapses. Returns the
    /// number of connections still registered.
    pub async fn drained(&self, deadline: Duration) -> usize {
        let mut active = self.active.subscribe();
        let _ = tokio::time::timeout(deadline, active.wait_for(|n| *n == 0)).await;
        self.len()
    }

    fn advance(&self, id: u64, next: ConnState) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        if !entry.state.can_advance_to(next) {
            tracing::warn!(
                "connection {} ignored transition {:?} -> {:?}",
                entry.peer,
                entry.state,
                next
            );
            return false;
        }
        tracing::trace!("connection {}: {:?} -> {:?}", entry.peer, entry.state, next);
        entry.state = next;
        true
    }

    fn state(&self, id: u64) -> ConnState {
        self.lock()
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(ConnState::Closed)
    }

    fn remove(&self, id: u64) {
        let len = {
            let mut entries = self.lock();
            entries.remove(&id);
            entries.len()
        };
        self.active.send_replace(len);
    }
}

/// A registered connection.
///
/// Shared between the task serving the client socket and, once a CONNECT
/// succeeds, the tunnel task. The registry entry is removed when the last
/// clone is dropped.
pub(crate) struct Connection {
    id: u64,
    peer: SocketAddr,
    token: CancellationToken,
    registry: Arc<Registry>,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancelled when the owning server closes this connection.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn advance(&self, next: ConnState) -> bool {
        self.registry.advance(self.id, next)
    }

    pub fn state(&self) -> ConnState {
        self.registry.state(self.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.registry.advance(self.id, ConnState::Closed);
        self.token.cancel();
        self.registry.remove(self.id);
    }
}
