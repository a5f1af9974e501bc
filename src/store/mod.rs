//! Queue storage access.
//!
//! [`StoreClient`] is the connection facade; [`JobStore`] is the
//! operation-level seam the runner and chron engines consume, with
//! [`RedisJobStore`] as the production implementation.

pub mod client;
pub mod health;
pub mod keys;
#[cfg(test)]
pub(crate) mod memory;
pub mod redis_store;
pub mod scripts;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::StoreError;

pub use client::{Request, StoreClient};
pub use redis_store::RedisJobStore;

/// Maximum number of items each scan of the reclamation script touches.
pub const RECLAIM_BATCH_LIMIT: usize = 500;

/// Age after which abandoned jobs are permanently deleted.
pub const PRUNE_AGE_SECS: i64 = 7 * 86_400;

/// Arguments for one reclamation script call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimParams {
    /// Queues-with-jobs set member, passed through untouched.
    pub queue_id: String,
    pub job_type: String,
    pub domain: String,
    /// Claims scored at or below this are stale.
    pub claim_cutoff: i64,
    /// Abandoned jobs scored at or below this are deleted.
    pub prune_cutoff: i64,
    pub max_attempts: u64,
    pub now: i64,
    pub limit: usize,
}

/// Counters returned by the reclamation script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimCounts {
    pub released: u64,
    pub abandoned: u64,
    pub pruned: u64,
    pub undelayed: u64,
    pub ready: u64,
}

impl ReclaimCounts {
    /// Builds counts from the script's five-element reply.
    pub fn from_reply(reply: &[i64]) -> Result<Self, StoreError> {
        match reply {
            [released, abandoned, pruned, undelayed, ready] => Ok(Self {
                released: non_negative(*released)?,
                abandoned: non_negative(*abandoned)?,
                pruned: non_negative(*pruned)?,
                undelayed: non_negative(*undelayed)?,
                ready: non_negative(*ready)?,
            }),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected 5 reclaim counters, got {}",
                other.len()
            ))),
        }
    }

    /// Total jobs moved by the call, excluding the ready tally.
    pub fn affected(&self) -> u64 {
        self.released + self.abandoned + self.pruned + self.undelayed
    }
}

fn non_negative(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::UnexpectedReply(format!("negative counter {}", value)))
}

/// Operations on the partitioned queue store and the aggregators.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Partition servers, in configuration order.
    fn partitions(&self) -> Vec<String>;

    /// Members of the queues-with-jobs set on `partition`.
    async fn queues_with_jobs(&self, partition: &str) -> Result<Vec<String>, StoreError>;

    /// Runs the reclamation script for one queue on `partition`.
    async fn reclaim(
        &self,
        partition: &str,
        params: &ReclaimParams,
    ) -> Result<ReclaimCounts, StoreError>;

    /// Takes lock slot `key` if it is absent or older than `ttl` seconds.
    async fn acquire_lock_slot(&self, key: &str, now: f64, ttl: f64) -> Result<bool, StoreError>;

    /// Re-stamps a held lock slot.
    async fn refresh_lock_slot(&self, key: &str, now: f64) -> Result<(), StoreError>;

    /// Deletes a lock slot. Returns whether any replica held it.
    async fn release_lock_slot(&self, key: &str) -> Result<bool, StoreError>;

    /// Replaces the ready-queue map on every aggregator.
    ///
    /// Returns the number of replicas updated.
    async fn publish_ready_queues(&self, map: &BTreeMap<String, i64>) -> Result<usize, StoreError>;

    /// Reads the ready-queue map from the first reachable aggregator.
    async fn load_ready_queues(&self) -> Result<HashMap<String, String>, StoreError>;
}
