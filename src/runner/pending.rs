//! Pending queue map and its short-lived cache.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

use crate::store::keys::{decode_queue_name, EPOCH_FIELD};
use crate::store::JobStore;

/// Map of job type => domain => UNIX time the queue was seen ready.
pub type PendingQueues = BTreeMap<String, BTreeMap<String, i64>>;

/// How long a loaded ready map is reused.
pub const READY_CACHE_TTL: Duration = Duration::from_secs(1);

/// Turns the raw aggregator hash into a [`PendingQueues`] tree.
pub fn build_pending(raw: HashMap<String, String>) -> PendingQueues {
    let mut pending = PendingQueues::new();
    for (name, stamp) in raw {
        if name == EPOCH_FIELD {
            continue;
        }
        let Some((job_type, domain)) = decode_queue_name(&name) else {
            debug!(queue = %name, "Ignoring undecodable ready queue name");
            continue;
        };
        let stamp = stamp.parse::<f64>().map(|s| s as i64).unwrap_or(0);
        pending.entry(job_type).or_default().insert(domain, stamp);
    }
    pending
}

/// Removes one queue; drops the type entry once it has no domains left.
pub fn remove_pending(pending: &mut PendingQueues, job_type: &str, domain: &str) -> bool {
    let Some(domains) = pending.get_mut(job_type) else {
        return false;
    };
    let removed = domains.remove(domain).is_some();
    if domains.is_empty() {
        pending.remove(job_type);
    }
    removed
}

/// Ready map cache that falls back to the last good snapshot.
#[derive(Debug)]
pub struct ReadyQueueCache {
    pending: PendingQueues,
    loaded_at: Option<f64>,
    ttl: f64,
}

impl Default for ReadyQueueCache {
    fn default() -> Self {
        Self::new(READY_CACHE_TTL)
    }
}

impl ReadyQueueCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: PendingQueues::new(),
            loaded_at: None,
            ttl: ttl.as_secs_f64(),
        }
    }

    /// Returns the pending map, reloading it if older than the TTL.
    ///
    /// A failed reload keeps the previous snapshot and is retried on the
    /// next call.
    pub async fn get(&mut self, store: &dyn JobStore, now: f64) -> &mut PendingQueues {
        let fresh = self.loaded_at.is_some_and(|at| now - at <= self.ttl);
        if !fresh {
            match store.load_ready_queues().await {
                Ok(raw) => {
                    self.pending = build_pending(raw);
                    self.loaded_at = Some(now);
                }
                Err(e) => debug!(error = %e, "Using stale ready queue map"),
            }
        }
        &mut self.pending
    }
}
