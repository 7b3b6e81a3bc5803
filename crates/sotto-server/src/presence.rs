//! Presence transitions: join, departure, and typing signals.
//!
//! A connection moves `Anonymous → Joined → Departed`; the departed state is
//! terminal. Typing signals are broadcast events while joined, not state
//! transitions. Every transition broadcast carries the refreshed presence
//! snapshot so clients can rebuild their rosters and key directories.

use std::sync::Arc;

use tracing::{debug, info};

use sotto_core::messages::{ServerFrame, UserEntry};
use sotto_core::{timestamp_now, validate_username, ChatError};

use crate::registry::{ClaimError, ConnectionId, RemovedConnection, SessionRegistry};
use crate::router::{Audience, MessageRouter};

/// Validates join requests and announces presence transitions.
pub struct PresenceManager {
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
}

impl PresenceManager {
    pub fn new(registry: Arc<SessionRegistry>, router: MessageRouter) -> Self {
        Self { registry, router }
    }

    /// Handle a join request from an anonymous connection.
    ///
    /// On success the joiner privately receives its peer list, and a `join`
    /// broadcast with the full post-insertion snapshot goes to every other
    /// joined connection. On failure only the requester hears about it and
    /// may retry.
    pub async fn handle_join(
        &self,
        conn: ConnectionId,
        username: String,
        public_key: Option<String>,
    ) {
        if let Err(e) = validate_username(&username) {
            let reason = match e {
                ChatError::Validation(reason) => reason,
                other => other.to_string(),
            };
            debug!(conn = %conn, username = %username, reason = %reason, "join rejected");
            self.send_error(conn, &reason).await;
            return;
        }

        match self
            .registry
            .claim_username(conn, &username, public_key.clone())
            .await
        {
            Ok(()) => {}
            Err(ClaimError::UsernameTaken) => {
                debug!(conn = %conn, username = %username, "join rejected: name in use");
                self.send_error(conn, "Username already taken").await;
                return;
            }
            Err(ClaimError::UnknownConnection) => {
                debug!(conn = %conn, "join from unregistered connection");
                return;
            }
        }

        let users = self.registry.snapshot().await;

        // The joiner's private roster lists its peers; the broadcast to
        // everyone else carries the full post-insertion snapshot.
        let peers: Vec<UserEntry> = users
            .iter()
            .filter(|u| u.username != username)
            .cloned()
            .collect();
        self.router
            .send_to_connection(conn, &ServerFrame::Users { users: peers })
            .await;

        self.router
            .route(
                &ServerFrame::Join {
                    username: username.clone(),
                    public_key,
                    users,
                    timestamp: timestamp_now(),
                },
                Audience::Everyone,
                Some(conn),
            )
            .await;

        let online = self.registry.count().await;
        info!(conn = %conn, username = %username,
            online = online, "user joined");
    }

    /// Evict a connection and announce its departure if it had joined.
    ///
    /// Safe to invoke more than once for the same id: the registry only
    /// yields the entry on the first removal, so at most one `leave`
    /// broadcast is produced.
    pub async fn handle_disconnect(&self, conn: ConnectionId) {
        if let Some(removed) = self.registry.remove(conn).await {
            self.announce_departure(removed).await;
        }
    }

    /// Announce departures for entries already evicted by the sweep.
    pub async fn announce_departures(&self, removed: Vec<RemovedConnection>) {
        for entry in removed {
            self.announce_departure(entry).await;
        }
    }

    async fn announce_departure(&self, removed: RemovedConnection) {
        let Some(username) = removed.username else {
            // Anonymous connections leave no presence trace.
            return;
        };

        let users = self.registry.snapshot().await;
        self.router
            .route(
                &ServerFrame::Leave {
                    username: username.clone(),
                    users,
                    timestamp: timestamp_now(),
                },
                Audience::Everyone,
                None,
            )
            .await;

        let online = self.registry.count().await;
        info!(conn = %removed.id, username = %username,
            online = online, "user left");
    }

    /// Fan out a typing or stop-typing signal from a joined connection.
    ///
    /// Signals from anonymous connections are silently ignored. There is no
    /// server-side expiry; a stop signal is client-driven only.
    pub async fn handle_typing(&self, conn: ConnectionId, stopped: bool) {
        let Some(username) = self.registry.username_of(conn).await else {
            debug!(conn = %conn, "typing signal before join ignored");
            return;
        };

        let timestamp = timestamp_now();
        let frame = if stopped {
            ServerFrame::StopTyping { username, timestamp }
        } else {
            ServerFrame::Typing { username, timestamp }
        };
        self.router.route(&frame, Audience::Everyone, Some(conn)).await;
    }

    async fn send_error(&self, conn: ConnectionId, message: &str) {
        self.router
            .send_to_connection(
                conn,
                &ServerFrame::Error {
                    message: message.to_string(),
                    timestamp: timestamp_now(),
                },
            )
            .await;
    }
}
