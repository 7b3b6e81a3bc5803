//! Fixed-window admission control for new connection attempts.
//!
//! One counter per source address, reset wholesale when its window elapses
//! rather than sliding continuously. Bursts straddling a window boundary are
//! accepted as a known tradeoff of the fixed-window scheme.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default attempts allowed per window.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Per-source counter state.
#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Gates new connections before they consume relay resources.
///
/// Methods take `&self` and use an internal lock so the check can run inside
/// the synchronous WebSocket upgrade callback.
#[derive(Debug)]
pub struct AdmissionController {
    max_attempts: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl AdmissionController {
    /// Create a controller allowing `max_attempts` per `window_secs` window.
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether an attempt from `source` is allowed, recording it.
    ///
    /// Returns `true` when admitted. The first attempt after the window has
    /// elapsed resets the counter to 1 with a fresh window start.
    pub fn check_and_record(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = windows.entry(source.to_string()).or_insert(RateWindow {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 1;
            return true;
        }

        if entry.count >= self.max_attempts {
            warn!(source, count = entry.count, "connection attempt rate limited");
            return false;
        }

        entry.count += 1;
        true
    }

    /// Drop windows whose interval has fully elapsed.
    ///
    /// Counting semantics are unchanged: a live window is never dropped
    /// early, and a dropped source starts over at 1 on its next attempt.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.window_start) < self.window);
        let dropped = before - windows.len();
        if dropped > 0 {
            debug!(dropped, "admission GC removed elapsed windows");
        }
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW_SECS)
    }
}
