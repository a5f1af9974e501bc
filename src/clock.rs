//! Wall-clock access for the scheduling and lease logic.
//!
//! Every timestamp the daemons compare (claim cutoffs, slot ages, priority
//! windows, pool-lock leases) is UNIX time read through [`Clock`], so tests
//! can drive the state machines with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Source of UNIX time.
pub trait Clock: Send + Sync {
    /// Current UNIX time in seconds, with sub-second precision.
    fn now(&self) -> f64;

    /// Current UNIX time in whole seconds.
    fn now_secs(&self) -> i64 {
        self.now().floor() as i64
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `secs` UNIX seconds.
    pub fn new(secs: f64) -> Self {
        Self {
            micros: AtomicU64::new((secs * 1_000_000.0) as u64),
        }
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        self.micros
            .fetch_add((secs * 1_000_000.0) as u64, Ordering::SeqCst);
    }

    /// Jumps the clock to `secs` UNIX seconds.
    pub fn set(&self, secs: f64) {
        self.micros
            .store((secs * 1_000_000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}
