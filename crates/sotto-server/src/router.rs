//! Message router: resolves a logical send into concrete per-socket writes.
//!
//! The router is content-agnostic: whether the serialized frame carries an
//! encryption envelope or presence data is irrelevant to routing. Targets
//! are collected under a single registry read lock, the lock is released,
//! and all writes are dispatched as one batch and joined — success or
//! failure — before the report is returned. Delivery is best-effort per
//! recipient: one failed write never aborts the rest, and no ordering is
//! guaranteed across recipients.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use sotto_core::messages::ServerFrame;

use crate::registry::{ConnectionId, SessionRegistry};

/// Who a routed frame is for.
#[derive(Debug, Clone)]
pub enum Audience {
    /// Every Open, joined connection.
    Everyone,
    /// Only the named users.
    Users(Vec<String>),
}

/// Outcome of one routed send.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

/// Fans frames out to subsets of connected peers.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    /// Create a router backed by the session registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `frame` to the audience, excluding `exclude` if present.
    ///
    /// The frame is serialized once; every recipient receives the same
    /// bytes. Exactly one write is attempted per matching recipient.
    pub async fn route(
        &self,
        frame: &ServerFrame,
        audience: Audience,
        exclude: Option<ConnectionId>,
    ) -> DeliveryReport {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                return DeliveryReport::default();
            }
        };

        let targets: Vec<_> = self
            .registry
            .open_targets()
            .await
            .into_iter()
            .filter(|t| Some(t.id) != exclude)
            .filter(|t| match &audience {
                Audience::Everyone => true,
                Audience::Users(names) => t
                    .username
                    .as_ref()
                    .is_some_and(|u| names.iter().any(|n| n == u)),
            })
            .collect();

        let sends = targets.into_iter().map(|target| {
            let json = json.clone();
            async move {
                match target.sender.send(Message::Text(json)).await {
                    Ok(()) => (target.id, true),
                    Err(e) => {
                        warn!(conn = %target.id, error = %e, "recipient write failed");
                        (target.id, false)
                    }
                }
            }
        });

        let results = join_all(sends).await;

        let mut report = DeliveryReport {
            attempted: results.len(),
            ..DeliveryReport::default()
        };
        for (id, ok) in results {
            if ok {
                report.delivered += 1;
            } else {
                report.failed.push(id);
            }
        }
        report
    }

    /// Deliver a frame to exactly one connection, joined or not.
    ///
    /// Returns whether the write was accepted. Failures are logged, never
    /// surfaced to other connections.
    pub async fn send_to_connection(&self, id: ConnectionId, frame: &ServerFrame) -> bool {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                return false;
            }
        };

        let Some(sender) = self.registry.sender_of(id).await else {
            debug!(conn = %id, "unicast target no longer registered");
            return false;
        };

        match sender.send(Message::Text(json)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %id, error = %e, "unicast write failed");
                false
            }
        }
    }
}
