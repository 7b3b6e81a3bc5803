//! sotto-client: client library for the sotto chat relay.
//!
//! Runs the end-to-end encryption envelope protocol (per-message content
//! keys wrapped once per recipient), maintains the public-key directory
//! fed by presence broadcasts, and manages the connection lifecycle with an
//! exponential-backoff reconnect supervisor. The relay only ever sees the
//! opaque envelope.

pub mod client;
pub mod directory;
pub mod envelope;
pub mod keys;
pub mod session;
pub mod supervisor;

pub use client::{ChatClient, ChatEvent};
pub use directory::KeyDirectory;
pub use envelope::{Envelope, SELF_SLOT};
pub use keys::DeviceKeys;
pub use session::{CipherSession, UNDECRYPTABLE_PLACEHOLDER};
pub use supervisor::{ReconnectSupervisor, SupervisorHandle, SupervisorState};
