//! Relay server library for sotto.
//!
//! The binary in `main.rs` is a thin wrapper; everything the relay does —
//! admission control, the session registry, presence transitions, message
//! fan-out, and the socket loops — lives here so integration tests can
//! drive a real server on an ephemeral port.

pub mod admission;
pub mod config;
pub mod presence;
pub mod registry;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use server::{ChatServer, WS_PATH};
