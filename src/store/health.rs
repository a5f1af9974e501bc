//! Down-server tracking for the store client.
//!
//! A server that fails to connect is skipped without any connection attempt
//! until its cool-down window elapses, bounding the cost of a dead partition
//! to one connect timeout per window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long a server stays marked down after a connection failure.
pub const DOWN_COOLDOWN: Duration = Duration::from_secs(30);

/// Map of server => instant its cool-down ends.
#[derive(Debug, Default)]
pub struct DownServers {
    until: HashMap<String, Instant>,
    cooldown: Duration,
}

impl DownServers {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            until: HashMap::new(),
            cooldown,
        }
    }

    /// Marks `server` down starting at `now`.
    pub fn mark_down(&mut self, server: &str, now: Instant) {
        self.until.insert(server.to_string(), now + self.cooldown);
    }

    /// Returns whether `server` is still inside its cool-down window.
    ///
    /// Expired entries are dropped so the next call may try to connect.
    pub fn is_down(&mut self, server: &str, now: Instant) -> bool {
        match self.until.get(server) {
            Some(&until) if now > until => {
                self.until.remove(server);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Number of servers currently tracked as down.
    pub fn len(&self) -> usize {
        self.until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_down_until_cooldown_elapses() {
        let mut down = DownServers::new(DOWN_COOLDOWN);
        let start = Instant::now();

        assert!(!down.is_down("rdb1:6379", start));
        down.mark_down("rdb1:6379", start);

        assert!(down.is_down("rdb1:6379", start + Duration::from_secs(10)));
        assert!(down.is_down("rdb1:6379", start + DOWN_COOLDOWN));
        assert!(!down.is_down("rdb2:6379", start + Duration::from_secs(10)));

        assert!(!down.is_down("rdb1:6379", start + DOWN_COOLDOWN + Duration::from_secs(1)));
        assert!(down.is_empty());
    }

    #[test]
    fn test_mark_down_again_extends_window() {
        let mut down = DownServers::new(Duration::from_secs(5));
        let start = Instant::now();

        down.mark_down("a", start);
        down.mark_down("a", start + Duration::from_secs(4));
        assert!(down.is_down("a", start + Duration::from_secs(8)));
        assert_eq!(down.len(), 1);
    }
}
