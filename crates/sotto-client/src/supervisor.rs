//! Reconnect supervisor: exponential backoff with external cancellation.
//!
//! An explicit state machine rather than a recursively rescheduled
//! callback: {Idle, Connecting, Connected, Backoff(attempt)}, with the
//! cancellation condition — the username reference being cleared — checked
//! at each scheduled transition. A connection attempt is gated on a
//! username being present; the cipher keypair exists from the moment its
//! session is constructed, so a caller that builds the [`CipherSession`]
//! before starting the supervisor never opens a socket without keys.
//!
//! [`CipherSession`]: crate::session::CipherSession

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use sotto_core::ChatResult;

/// Default first-retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Where the supervisor currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    Backoff(u32),
}

#[derive(Debug)]
struct Inner {
    username: Mutex<Option<String>>,
    state: Mutex<SupervisorState>,
}

/// Shared handle for observing and steering a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    inner: Arc<Inner>,
}

impl SupervisorHandle {
    /// Set the username that gates connection attempts.
    pub async fn set_username(&self, username: impl Into<String>) {
        *self.inner.username.lock().await = Some(username.into());
    }

    /// Cancel: clearing the username makes the next scheduled transition
    /// abandon the reconnect loop cleanly.
    pub async fn clear_username(&self) {
        *self.inner.username.lock().await = None;
    }

    /// Mark the connection as established. Called by the connect closure
    /// once the socket is open, so observers see Connecting → Connected.
    pub async fn mark_connected(&self) {
        *self.inner.state.lock().await = SupervisorState::Connected;
    }

    pub async fn state(&self) -> SupervisorState {
        *self.inner.state.lock().await
    }
}

/// Drives connect attempts with exponential backoff.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    base_delay: Duration,
    max_delay: Duration,
    inner: Arc<Inner>,
}

impl ReconnectSupervisor {
    /// Supervisor with the default 1 s base and 30 s ceiling.
    pub fn new() -> Self {
        Self::with_delays(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            inner: Arc::new(Inner {
                username: Mutex::new(None),
                state: Mutex::new(SupervisorState::Idle),
            }),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Delay before retry number `attempt`: base doubled per attempt,
    /// capped at the ceiling.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        doubled.min(self.max_delay)
    }

    /// Run the reconnect loop until the username is cleared.
    ///
    /// `connect` receives the gating username and a handle (to mark the
    /// Connected state); its future resolving — with or without error —
    /// means the connection ended. A session that ran resets the attempt
    /// counter; a failed attempt doubles the next delay.
    pub async fn run<C, F>(&self, mut connect: C)
    where
        C: FnMut(String, SupervisorHandle) -> F,
        F: Future<Output = ChatResult<()>>,
    {
        let mut attempt: u32 = 0;
        loop {
            // Cancellation point: a cleared username abandons the loop.
            let Some(username) = self.inner.username.lock().await.clone() else {
                self.set_state(SupervisorState::Idle).await;
                debug!("reconnect supervisor idle: no username");
                return;
            };

            self.set_state(SupervisorState::Connecting).await;
            match connect(username, self.handle()).await {
                Ok(()) => {
                    debug!("connection ended");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "connection attempt failed");
                }
            }

            let delay = self.backoff_delay(attempt);
            self.set_state(SupervisorState::Backoff(attempt)).await;
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn set_state(&self, state: SupervisorState) {
        *self.inner.state.lock().await = state;
    }
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
