//! Statsd counter sink.
//!
//! Counter increments are buffered in memory and sent on [`StatsClient::flush`]
//! as fire-and-forget UDP packets. Lines are coalesced into packets of at most
//! [`MAX_UDP_SIZE`] bytes, per the statsd batching convention of one metric
//! per line.

use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::StatsdEndpoint;

/// Maximum size of one statsd packet.
pub const MAX_UDP_SIZE: usize = 512;

/// Prefix for every counter name.
const PREFIX: &str = "jobrunner";

/// Buffered statsd counter client.
///
/// Cloning is cheap; clones share the same buffer and socket.
#[derive(Debug, Clone)]
pub struct StatsClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Option<StatsdEndpoint>,
    pending: Mutex<Vec<String>>,
    socket: OnceCell<UdpSocket>,
}

impl StatsClient {
    /// Creates a client sending to `endpoint`, or a no-op client if `None`.
    pub fn new(endpoint: Option<StatsdEndpoint>) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                pending: Mutex::new(Vec::new()),
                socket: OnceCell::new(),
            }),
        }
    }

    /// Creates a client that drops every counter.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Returns whether counters are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.inner.endpoint.is_some()
    }

    /// Buffers a counter increment of `delta` for `event`.
    pub fn incr(&self, event: &str, delta: i64) {
        if !self.is_enabled() || delta == 0 {
            return;
        }
        let line = format_counter(event, delta);
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(line);
    }

    /// Number of counter lines waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Client that records counters but is never flushed by tests.
    #[cfg(test)]
    pub(crate) fn recording() -> Self {
        Self::new(Some(StatsdEndpoint {
            host: "127.0.0.1".to_string(),
            port: 9,
        }))
    }

    /// Sum of buffered deltas for `event`.
    #[cfg(test)]
    pub(crate) fn pending_total(&self, event: &str) -> i64 {
        let prefix = format!("{}.{}:", PREFIX, event);
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter_map(|line| line.strip_prefix(&prefix))
            .filter_map(|rest| rest.trim_end().strip_suffix("|c"))
            .filter_map(|n| n.parse::<i64>().ok())
            .sum()
    }

    /// Sends all buffered counters and clears the buffer.
    ///
    /// Send failures are logged at debug level and otherwise ignored.
    pub async fn flush(&self) {
        let lines = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        let Some(endpoint) = &self.inner.endpoint else {
            return;
        };
        if lines.is_empty() {
            return;
        }

        let socket = match self
            .inner
            .socket
            .get_or_try_init(|| UdpSocket::bind("0.0.0.0:0"))
            .await
        {
            Ok(socket) => socket,
            Err(e) => {
                debug!(error = %e, "Could not open statsd socket");
                return;
            }
        };

        for packet in coalesce_packets(lines) {
            let target = (endpoint.host.as_str(), endpoint.port);
            if let Err(e) = socket.send_to(packet.as_bytes(), target).await {
                debug!(error = %e, host = %endpoint.host, "Failed to send statsd packet");
            }
        }
    }
}

/// Formats one counter line, newline included.
pub fn format_counter(event: &str, delta: i64) -> String {
    format!("{}.{}:{}|c\n", PREFIX, event, delta)
}

/// Merges counter lines into as few packets as possible without any packet
/// exceeding [`MAX_UDP_SIZE`] bytes.
///
/// A line that is oversized on its own is sent as its own packet.
pub fn coalesce_packets(lines: Vec<String>) -> Vec<String> {
    let mut packets: Vec<String> = Vec::new();
    for line in lines {
        match packets.last_mut() {
            Some(last)
                if line.len() < MAX_UDP_SIZE && last.len() + line.len() <= MAX_UDP_SIZE =>
            {
                last.push_str(&line);
            }
            _ => packets.push(line),
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_counter() {
        assert_eq!(
            format_counter("runner-status.timeout", 1),
            "jobrunner.runner-status.timeout:1|c\n"
        );
        assert_eq!(format_counter("memory.host1", -42), "jobrunner.memory.host1:-42|c\n");
    }

    #[test]
    fn test_coalesce_small_lines() {
        let lines: Vec<String> = (0..3).map(|i| format_counter(&format!("e{i}"), 1)).collect();
        let packets = coalesce_packets(lines);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], "jobrunner.e0:1|c\njobrunner.e1:1|c\njobrunner.e2:1|c\n");
    }

    #[test]
    fn test_coalesce_respects_packet_size() {
        // each line is exactly 100 bytes
        let line = format!("{}\n", "x".repeat(99));
        let packets = coalesce_packets(vec![line.clone(); 12]);

        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 500);
        assert_eq!(packets[1].len(), 500);
        assert_eq!(packets[2].len(), 200);
        assert!(packets.iter().all(|p| p.len() <= MAX_UDP_SIZE));
    }

    #[test]
    fn test_coalesce_oversized_line_stands_alone() {
        let big = format!("{}\n", "y".repeat(600));
        let small = format_counter("a", 1);
        let packets = coalesce_packets(vec![small.clone(), big.clone(), small.clone()]);

        assert_eq!(packets, vec![small.clone(), big, small]);
    }

    #[test]
    fn test_disabled_client_drops_counters() {
        let stats = StatsClient::disabled();
        stats.incr("spawn.host", 3);
        assert!(!stats.is_enabled());
        assert_eq!(stats.pending_len(), 0);
    }

    #[test]
    fn test_zero_delta_ignored() {
        let stats = StatsClient::new(Some(StatsdEndpoint {
            host: "127.0.0.1".to_string(),
            port: 8125,
        }));
        stats.incr("spawn.host", 0);
        stats.incr("spawn.host", 2);
        assert_eq!(stats.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_flush_sends_udp_packet() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let stats = StatsClient::new(Some(StatsdEndpoint {
            host: "127.0.0.1".to_string(),
            port,
        }));
        let clone = stats.clone();
        stats.incr("periodictasks.claimed.host1", 1);
        clone.incr("job-recycle.refreshLinks", 7);
        stats.flush().await;
        assert_eq!(stats.pending_len(), 0);

        let mut buf = [0u8; MAX_UDP_SIZE];
        let len = tokio::time::timeout(std::time::Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .expect("packet should arrive")
            .unwrap();
        let packet = std::str::from_utf8(&buf[..len]).unwrap();
        assert_eq!(
            packet,
            "jobrunner.periodictasks.claimed.host1:1|c\njobrunner.job-recycle.refreshLinks:7|c\n"
        );
    }
}
