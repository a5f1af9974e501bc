//! High/low priority time-sharing per runner loop.

use crate::config::PriorityWindows;

/// Priority state of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPriority {
    /// Whether the loop currently serves only high priority types.
    pub high: bool,
    /// UNIX time of the last switch.
    pub since: i64,
}

impl LoopPriority {
    pub fn new(high: bool, since: i64) -> Self {
        Self { high, since }
    }

    /// Switches priority once the current one has been held too long.
    ///
    /// High priority is left after `lp_max_delay`, low priority after
    /// `hp_max_delay`. Returns whether a switch happened.
    pub fn advance(&mut self, now: i64, windows: &PriorityWindows) -> bool {
        let held = now - self.since;
        let limit = if self.high {
            windows.lp_max_delay
        } else {
            windows.hp_max_delay
        };
        if held > limit as i64 {
            self.flip(now);
            return true;
        }
        false
    }

    /// Switches priority unconditionally.
    pub fn flip(&mut self, now: i64) {
        self.high = !self.high;
        self.since = now;
    }

    /// Time box handed to dispatchers spawned in this state.
    pub fn dispatcher_max_time(&self, windows: &PriorityWindows) -> u64 {
        if self.high {
            windows.lp_max_time
        } else {
            windows.hp_max_time
        }
    }

    pub fn label(&self) -> &'static str {
        if self.high {
            "high"
        } else {
            "low"
        }
    }
}
