//! sotto-core: Shared protocol library for the sotto chat relay.
//!
//! Provides the JSON wire message types, frame size limits, username
//! validation, identifier/timestamp helpers, and the error taxonomy shared
//! by the relay server and the client library.

pub mod error;
pub mod ids;
pub mod messages;
pub mod validate;

// Re-export commonly used items at crate root.
pub use error::{ChatError, ChatResult};
pub use ids::{message_id, timestamp_now};
pub use messages::{ClientFrame, ServerFrame, UserEntry, MAX_CIPHERTEXT_BYTES, MAX_FRAME_BYTES};
pub use validate::validate_username;
