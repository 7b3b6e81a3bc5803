//! Session registry: the single source of truth for who is online.
//!
//! Every accepted socket gets a stable opaque [`ConnectionId`] at insert
//! time; all other subsystems address connections only through this
//! registry, never by holding socket references, so disconnect-while-
//! iterating races cannot occur.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use sotto_core::messages::UserEntry;

/// Opaque handle for a connection, unique for the socket's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    Closed,
}

/// State tracked for one connection. Owned exclusively by the registry.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    /// Unset until a join succeeds.
    pub username: Option<String>,
    /// Opaque wrap key published at join, relayed verbatim.
    pub public_key: Option<String>,
    pub connected_at: Instant,
    /// Set when the username claim succeeds; orders presence snapshots.
    pub joined_at: Option<Instant>,
    pub state: SocketState,
    /// Outbound queue feeding the connection's writer task.
    pub sender: mpsc::Sender<Message>,
}

/// A connection evicted from the registry.
#[derive(Debug)]
pub struct RemovedConnection {
    pub id: ConnectionId,
    pub username: Option<String>,
}

/// Outcome of trying to claim a username.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// Another Open connection already holds this username.
    UsernameTaken,
    /// The connection is no longer registered.
    UnknownConnection,
}

/// A fan-out target: the connection's id, username, and outbound sender,
/// cloned out of the registry so no lock is held across the write.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub id: ConnectionId,
    pub username: Option<String>,
    pub sender: mpsc::Sender<Message>,
}

/// Concurrent map of all live connections.
pub struct SessionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted socket and return its handle.
    pub async fn insert(&self, sender: mpsc::Sender<Message>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = ConnectionEntry {
            id,
            username: None,
            public_key: None,
            connected_at: Instant::now(),
            joined_at: None,
            state: SocketState::Open,
            sender,
        };
        let mut conns = self.connections.write().await;
        conns.insert(id, entry);
        debug!(conn = %id, total = conns.len(), "connection registered");
        id
    }

    /// Atomically claim a username for a connection.
    ///
    /// Fails if another Open connection already holds the exact username.
    /// Uniqueness applies to active, joined connections only; a name freed
    /// by a departure may be claimed again.
    pub async fn claim_username(
        &self,
        id: ConnectionId,
        username: &str,
        public_key: Option<String>,
    ) -> Result<(), ClaimError> {
        let mut conns = self.connections.write().await;

        let taken = conns.values().any(|c| {
            c.id != id && c.state == SocketState::Open && c.username.as_deref() == Some(username)
        });
        if taken {
            return Err(ClaimError::UsernameTaken);
        }

        let entry = conns.get_mut(&id).ok_or(ClaimError::UnknownConnection)?;
        entry.username = Some(username.to_string());
        entry.public_key = public_key;
        entry.joined_at = Some(Instant::now());
        Ok(())
    }

    /// Username of a connection, if it has joined.
    pub async fn username_of(&self, id: ConnectionId) -> Option<String> {
        let conns = self.connections.read().await;
        conns.get(&id).and_then(|c| c.username.clone())
    }

    /// Point-in-time snapshot of all Open, joined connections, ordered by
    /// join time.
    pub async fn snapshot(&self) -> Vec<UserEntry> {
        let conns = self.connections.read().await;
        let mut joined: Vec<&ConnectionEntry> = conns
            .values()
            .filter(|c| c.state == SocketState::Open && c.username.is_some())
            .collect();
        joined.sort_by_key(|c| c.joined_at);
        joined
            .iter()
            .filter_map(|c| {
                c.username.as_ref().map(|username| UserEntry {
                    username: username.clone(),
                    public_key: c.public_key.clone(),
                })
            })
            .collect()
    }

    /// Cloned outbound senders for every Open, joined connection.
    pub async fn open_targets(&self) -> Vec<DeliveryTarget> {
        let conns = self.connections.read().await;
        conns
            .values()
            .filter(|c| c.state == SocketState::Open && c.username.is_some())
            .map(|c| DeliveryTarget {
                id: c.id,
                username: c.username.clone(),
                sender: c.sender.clone(),
            })
            .collect()
    }

    /// Outbound sender for a single connection, joined or not.
    pub async fn sender_of(&self, id: ConnectionId) -> Option<mpsc::Sender<Message>> {
        let conns = self.connections.read().await;
        conns.get(&id).map(|c| c.sender.clone())
    }

    /// Mark a connection as closing (close frame seen, eviction pending).
    pub async fn mark_closing(&self, id: ConnectionId) {
        let mut conns = self.connections.write().await;
        if let Some(entry) = conns.get_mut(&id) {
            entry.state = SocketState::Closing;
        }
    }

    /// Remove a connection. Idempotent: only the first call returns the
    /// evicted entry, so the caller can announce the departure exactly once.
    pub async fn remove(&self, id: ConnectionId) -> Option<RemovedConnection> {
        let mut conns = self.connections.write().await;
        conns.remove(&id).map(|entry| {
            info!(conn = %id, username = entry.username.as_deref().unwrap_or("-"),
                remaining = conns.len(), "connection removed");
            RemovedConnection {
                id,
                username: entry.username,
            }
        })
    }

    /// Evict entries whose socket is no longer Open or whose outbound
    /// channel has shut down without a clean disconnect.
    ///
    /// Returns the evicted entries so departures can be announced.
    pub async fn sweep_stale(&self) -> Vec<RemovedConnection> {
        let mut conns = self.connections.write().await;
        let mut removed = Vec::new();

        conns.retain(|id, entry| {
            if entry.state != SocketState::Open || entry.sender.is_closed() {
                removed.push(RemovedConnection {
                    id: *id,
                    username: entry.username.clone(),
                });
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed stale connections");
        }

        removed
    }

    /// Number of registered connections (joined or not).
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
