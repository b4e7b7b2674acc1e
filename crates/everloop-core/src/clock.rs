//! Clock abstraction.
//!
//! The engine is driven by one authoritative monotonic clock supplied by
//! the host, typically the audio sink's hardware-synchronized clock. The
//! epoch is arbitrary; the session records its own origin on `play()`.

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A monotonic clock reporting seconds since an arbitrary epoch.
pub trait Clock {
    /// Current time in seconds.
    fn now(&self) -> f64;
}

/// Wall-clock implementation backed by [`Instant`].
#[derive(Clone, Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// Create a clock whose epoch is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for tests and offline rendering.
///
/// Clones share the same time source, so a test can keep one handle and
/// advance time while the session holds another.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    seconds: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let mut t = self.seconds.lock().unwrap_or_else(|e| e.into_inner());
        *t += seconds;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, seconds: f64) {
        let mut t = self.seconds.lock().unwrap_or_else(|e| e.into_inner());
        *t = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.seconds.lock().unwrap_or_else(|e| e.into_inner())
    }
}
