//! JSON wire messages for the relay endpoint.
//!
//! Every frame is a newline-free UTF-8 JSON object carrying a `type`
//! discriminator. The relay treats `encryptedMessage` as opaque text: the
//! envelope format inside it is a client-side concern.

use serde::{Deserialize, Serialize};

/// Maximum size of an inbound text frame in bytes. Oversized frames get an
/// `error` reply and are otherwise ignored; the connection stays open.
pub const MAX_FRAME_BYTES: usize = 10 * 1024;

/// Maximum size of the `encryptedMessage` field in bytes.
pub const MAX_CIPHERTEXT_BYTES: usize = 8 * 1024;

/// One entry of a presence snapshot: a joined user and its wrap key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub username: String,
    pub public_key: Option<String>,
}

/// Frames a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Request to join under a username, optionally publishing a wrap key.
    Join {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// An opaque encrypted payload to relay. Without `recipients` the relay
    /// broadcasts to every other joined connection; with a non-empty list it
    /// delivers only to the named users.
    Message {
        encrypted_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipients: Option<Vec<String>>,
    },
    /// Transient typing signal, fanned out with the sender's username.
    Typing,
    /// Client-driven end of a typing signal.
    StopTyping,
    /// Application-level keepalive; the relay replies with `pong`.
    Ping,
}

/// Frames the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Presence snapshot pushed privately to a connection that just joined.
    Users { users: Vec<UserEntry> },
    /// A peer joined. Carries the refreshed snapshot.
    Join {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        users: Vec<UserEntry>,
        timestamp: String,
    },
    /// A peer left. Carries the refreshed snapshot.
    Leave {
        username: String,
        users: Vec<UserEntry>,
        timestamp: String,
    },
    /// A relayed encrypted payload, stamped with sender, time, and id.
    Message {
        username: String,
        encrypted_message: String,
        timestamp: String,
        message_id: String,
    },
    Typing {
        username: String,
        timestamp: String,
    },
    StopTyping {
        username: String,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}
