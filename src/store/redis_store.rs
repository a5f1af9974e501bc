//! Redis implementation of [`JobStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;

use super::client::StoreClient;
use super::keys::{ready_queue_temp_key, QueueKeys, QUEUES_WITH_JOBS_KEY, READY_QUEUE_KEY};
use super::{scripts, JobStore, ReclaimCounts, ReclaimParams};

/// Job store backed by partition and aggregator Redis servers.
pub struct RedisJobStore {
    client: Arc<StoreClient>,
    partitions: Vec<String>,
    aggregators: Vec<String>,
}

impl RedisJobStore {
    pub fn new(client: Arc<StoreClient>, partitions: Vec<String>, aggregators: Vec<String>) -> Self {
        Self {
            client,
            partitions,
            aggregators,
        }
    }

    pub fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn partitions(&self) -> Vec<String> {
        self.partitions.clone()
    }

    async fn queues_with_jobs(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(QUEUES_WITH_JOBS_KEY);
        self.client.execute_on(partition, &cmd).await
    }

    async fn reclaim(
        &self,
        partition: &str,
        params: &ReclaimParams,
    ) -> Result<ReclaimCounts, StoreError> {
        let keys = QueueKeys::new(&params.job_type, &params.domain);
        let mut invocation = scripts::reclaim().prepare_invoke();
        for key in keys.script_keys() {
            invocation.key(key);
        }
        invocation
            .arg(params.claim_cutoff)
            .arg(params.prune_cutoff)
            .arg(params.max_attempts)
            .arg(params.now)
            .arg(&params.queue_id)
            .arg(params.limit);

        let reply: Vec<i64> = self.client.execute_on(partition, &invocation).await?;
        ReclaimCounts::from_reply(&reply)
    }

    async fn acquire_lock_slot(&self, key: &str, now: f64, ttl: f64) -> Result<bool, StoreError> {
        let mut invocation = scripts::acquire_lock().prepare_invoke();
        invocation.key(key).arg(now).arg(now - ttl);
        let taken: i64 = self.client.execute(&self.aggregators, &invocation).await?;
        Ok(taken == 1)
    }

    async fn refresh_lock_slot(&self, key: &str, now: f64) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(now);
        self.client.execute::<()>(&self.aggregators, &cmd).await
    }

    async fn release_lock_slot(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self.client.execute(&self.aggregators, &cmd).await?;
        Ok(removed > 0)
    }

    async fn publish_ready_queues(&self, map: &BTreeMap<String, i64>) -> Result<usize, StoreError> {
        let temp = ready_queue_temp_key();
        let mut pipe = redis::pipe();
        pipe.atomic().del(&temp).ignore();
        if map.is_empty() {
            pipe.del(READY_QUEUE_KEY).ignore();
        } else {
            let items: Vec<(&str, i64)> = map.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            pipe.hset_multiple(&temp, &items)
                .ignore()
                .rename(&temp, READY_QUEUE_KEY)
                .ignore();
        }

        let updated = self.client.broadcast(&self.aggregators, &pipe).await?;
        debug!(
            queues = map.len(),
            replicas = updated,
            "Published ready queue map"
        );
        Ok(updated)
    }

    async fn load_ready_queues(&self) -> Result<HashMap<String, String>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(READY_QUEUE_KEY);
        self.client.execute(&self.aggregators, &cmd).await
    }
}
