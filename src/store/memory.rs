//! In-memory [`JobStore`] for orchestration tests.
//!
//! Mirrors the reclamation script step for step and records every lock and
//! publish operation so tests can assert on them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;

use super::keys::{parse_queue_set_member, queue_set_member};
use super::{JobStore, ReclaimCounts, ReclaimParams};

/// State of one queue on one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct QueueState {
    pub claimed: HashMap<String, i64>,
    pub attempts: HashMap<String, u64>,
    /// Front is the list head (LPUSH side); consumers take from the back.
    pub unclaimed: VecDeque<String>,
    pub data: HashMap<String, String>,
    pub abandoned: HashMap<String, i64>,
    pub delayed: HashMap<String, i64>,
}

impl QueueState {
    /// Enqueues a job with payload the way producers do (LPUSH).
    pub fn push_unclaimed(&mut self, id: &str) -> &mut Self {
        self.data.insert(id.to_string(), format!("payload-{id}"));
        self.unclaimed.push_front(id.to_string());
        self
    }

    /// Adds a claimed job with `attempts` attempts so far.
    pub fn push_claimed(&mut self, id: &str, claimed_at: i64, attempts: u64) -> &mut Self {
        self.data.insert(id.to_string(), format!("payload-{id}"));
        self.claimed.insert(id.to_string(), claimed_at);
        self.attempts.insert(id.to_string(), attempts);
        self
    }

    pub fn push_abandoned(&mut self, id: &str, abandoned_at: i64) -> &mut Self {
        self.data.insert(id.to_string(), format!("payload-{id}"));
        self.abandoned.insert(id.to_string(), abandoned_at);
        self
    }

    pub fn push_delayed(&mut self, id: &str, ready_at: i64) -> &mut Self {
        self.data.insert(id.to_string(), format!("payload-{id}"));
        self.delayed.insert(id.to_string(), ready_at);
        self
    }
}

/// Up to `limit` ids with score at or below `cutoff`, oldest first.
fn range_by_score(set: &HashMap<String, i64>, cutoff: i64, limit: usize) -> Vec<(String, i64)> {
    let mut hits: Vec<(String, i64)> = set
        .iter()
        .filter(|(_, &score)| score <= cutoff)
        .map(|(id, &score)| (id.clone(), score))
        .collect();
    hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    hits.truncate(limit);
    hits
}

/// Same steps as `reclaim.lua`, against in-memory state.
///
/// Only a copy: `tests/redis_integration.rs` runs the real script and is the
/// check that the two agree.
pub(crate) fn reclaim_queue(
    queue: &mut QueueState,
    with_jobs: &mut BTreeSet<String>,
    params: &ReclaimParams,
) -> ReclaimCounts {
    if queue.data.is_empty() {
        with_jobs.remove(&params.queue_id);
        return ReclaimCounts::default();
    }

    let mut counts = ReclaimCounts::default();

    for (id, claimed_at) in range_by_score(&queue.claimed, params.claim_cutoff, params.limit) {
        let attempts = queue.attempts.get(&id).copied().unwrap_or(0);
        if attempts < params.max_attempts {
            queue.unclaimed.push_back(id.clone());
            counts.released += 1;
        } else {
            queue.abandoned.insert(id.clone(), claimed_at);
            counts.abandoned += 1;
        }
        queue.claimed.remove(&id);
    }

    for (id, _) in range_by_score(&queue.abandoned, params.prune_cutoff, params.limit) {
        queue.abandoned.remove(&id);
        queue.attempts.remove(&id);
        queue.data.remove(&id);
        counts.pruned += 1;
    }

    for (id, _) in range_by_score(&queue.delayed, params.now, params.limit) {
        queue.unclaimed.push_front(id.clone());
        queue.delayed.remove(&id);
        counts.undelayed += 1;
    }

    counts.ready = queue.unclaimed.len() as u64;
    let live = queue.unclaimed.len() + queue.claimed.len() + queue.delayed.len();
    if live > 0 {
        with_jobs.insert(params.queue_id.clone());
    } else {
        with_jobs.remove(&params.queue_id);
    }
    counts
}

#[derive(Debug, Default)]
struct Partition {
    queues: HashMap<(String, String), QueueState>,
    with_jobs: BTreeSet<String>,
    down: bool,
}

/// Test double holding partitions, lock slots and the ready map in memory.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    partition_names: Vec<String>,
    partitions: Mutex<HashMap<String, Partition>>,
    locks: Mutex<BTreeMap<String, f64>>,
    ready: Mutex<HashMap<String, String>>,
    published: Mutex<Vec<BTreeMap<String, i64>>>,
    aggregators_down: AtomicBool,
    reclaim_calls: AtomicUsize,
    refreshes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(partitions: &[&str]) -> Self {
        let store = Self {
            partition_names: partitions.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        {
            let mut map = store.partitions.lock().unwrap();
            for name in partitions {
                map.insert(name.to_string(), Partition::default());
            }
        }
        store
    }

    /// Installs a queue and registers it in the partition's queues-with-jobs set.
    pub fn add_queue(&self, partition: &str, job_type: &str, domain: &str, state: QueueState) {
        let mut map = self.partitions.lock().unwrap();
        let part = map.entry(partition.to_string()).or_default();
        part.with_jobs.insert(queue_set_member(job_type, domain));
        part.queues
            .insert((job_type.to_string(), domain.to_string()), state);
    }

    /// Adds a raw member to the queues-with-jobs set without queue state.
    pub fn add_set_member(&self, partition: &str, member: &str) {
        let mut map = self.partitions.lock().unwrap();
        map.entry(partition.to_string())
            .or_default()
            .with_jobs
            .insert(member.to_string());
    }

    pub fn queue(&self, partition: &str, job_type: &str, domain: &str) -> QueueState {
        let map = self.partitions.lock().unwrap();
        map.get(partition)
            .and_then(|p| p.queues.get(&(job_type.to_string(), domain.to_string())))
            .cloned()
            .unwrap_or_default()
    }

    pub fn with_jobs(&self, partition: &str) -> BTreeSet<String> {
        let map = self.partitions.lock().unwrap();
        map.get(partition)
            .map(|p| p.with_jobs.clone())
            .unwrap_or_default()
    }

    pub fn set_partition_down(&self, partition: &str, down: bool) {
        let mut map = self.partitions.lock().unwrap();
        map.entry(partition.to_string()).or_default().down = down;
    }

    pub fn set_aggregators_down(&self, down: bool) {
        self.aggregators_down.store(down, Ordering::SeqCst);
    }

    pub fn set_lock_slot(&self, key: &str, stamp: f64) {
        self.locks.lock().unwrap().insert(key.to_string(), stamp);
    }

    pub fn lock_slot(&self, key: &str) -> Option<f64> {
        self.locks.lock().unwrap().get(key).copied()
    }

    pub fn set_ready_queues(&self, map: HashMap<String, String>) {
        *self.ready.lock().unwrap() = map;
    }

    pub fn published(&self) -> Vec<BTreeMap<String, i64>> {
        self.published.lock().unwrap().clone()
    }

    pub fn reclaim_calls(&self) -> usize {
        self.reclaim_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn check_aggregators(&self) -> Result<(), StoreError> {
        if self.aggregators_down.load(Ordering::SeqCst) {
            return Err(StoreError::AllServersUnavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn partitions(&self) -> Vec<String> {
        self.partition_names.clone()
    }

    async fn queues_with_jobs(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let map = self.partitions.lock().unwrap();
        match map.get(partition) {
            Some(p) if p.down => Err(StoreError::ServerDown(partition.to_string())),
            Some(p) => Ok(p.with_jobs.iter().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn reclaim(
        &self,
        partition: &str,
        params: &ReclaimParams,
    ) -> Result<ReclaimCounts, StoreError> {
        self.reclaim_calls.fetch_add(1, Ordering::SeqCst);
        let mut map = self.partitions.lock().unwrap();
        let part = map.entry(partition.to_string()).or_default();
        if part.down {
            return Err(StoreError::ServerDown(partition.to_string()));
        }
        let key = parse_queue_set_member(&params.queue_id)
            .unwrap_or_else(|_| (params.job_type.clone(), params.domain.clone()));
        let queue = part.queues.entry(key).or_default();
        Ok(reclaim_queue(queue, &mut part.with_jobs, params))
    }

    async fn acquire_lock_slot(&self, key: &str, now: f64, ttl: f64) -> Result<bool, StoreError> {
        self.check_aggregators()?;
        let mut locks = self.locks.lock().unwrap();
        match locks.get(key) {
            Some(&stamp) if stamp >= now - ttl => Ok(false),
            _ => {
                locks.insert(key.to_string(), now);
                Ok(true)
            }
        }
    }

    async fn refresh_lock_slot(&self, key: &str, now: f64) -> Result<(), StoreError> {
        self.check_aggregators()?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.locks.lock().unwrap().insert(key.to_string(), now);
        Ok(())
    }

    async fn release_lock_slot(&self, key: &str) -> Result<bool, StoreError> {
        self.check_aggregators()?;
        Ok(self.locks.lock().unwrap().remove(key).is_some())
    }

    async fn publish_ready_queues(&self, map: &BTreeMap<String, i64>) -> Result<usize, StoreError> {
        self.check_aggregators()?;
        self.published.lock().unwrap().push(map.clone());
        *self.ready.lock().unwrap() = map
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        Ok(1)
    }

    async fn load_ready_queues(&self) -> Result<HashMap<String, String>, StoreError> {
        self.check_aggregators()?;
        Ok(self.ready.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PRUNE_AGE_SECS, RECLAIM_BATCH_LIMIT};

    const NOW: i64 = 1_700_000_000;

    fn params(claim_ttl: i64, max_attempts: u64) -> ReclaimParams {
        ReclaimParams {
            queue_id: queue_set_member("refreshLinks", "enwiki"),
            job_type: "refreshLinks".to_string(),
            domain: "enwiki".to_string(),
            claim_cutoff: NOW - claim_ttl,
            prune_cutoff: NOW - PRUNE_AGE_SECS,
            max_attempts,
            now: NOW,
            limit: RECLAIM_BATCH_LIMIT,
        }
    }

    #[test]
    fn test_stale_claims_land_in_exactly_one_place() {
        let mut queue = QueueState::default();
        queue
            .push_claimed("fresh", NOW - 10, 0)
            .push_claimed("retry", NOW - 4000, 1)
            .push_claimed("dead", NOW - 5000, 3);
        let mut with_jobs = BTreeSet::new();

        let counts = reclaim_queue(&mut queue, &mut with_jobs, &params(3600, 3));

        assert_eq!(counts.released, 1);
        assert_eq!(counts.abandoned, 1);
        assert_eq!(counts.ready, 1);
        for id in ["retry", "dead"] {
            assert!(!queue.claimed.contains_key(id));
            let in_unclaimed = queue.unclaimed.contains(&id.to_string());
            let in_abandoned = queue.abandoned.contains_key(id);
            assert!(in_unclaimed ^ in_abandoned, "{id} must be in exactly one place");
        }
        assert_eq!(queue.abandoned.get("dead"), Some(&(NOW - 5000)));
        assert!(queue.claimed.contains_key("fresh"));
        assert!(with_jobs.contains(&params(3600, 3).queue_id));
    }

    #[test]
    fn test_released_job_is_popped_next_and_undelayed_waits() {
        let mut queue = QueueState::default();
        queue
            .push_unclaimed("queued")
            .push_claimed("retry", NOW - 4000, 0)
            .push_delayed("due", NOW - 1);
        let mut with_jobs = BTreeSet::new();

        let counts = reclaim_queue(&mut queue, &mut with_jobs, &params(3600, 3));
        assert_eq!(counts.released, 1);
        assert_eq!(counts.undelayed, 1);

        // head (LPUSH side) to tail (RPOP side)
        let order: Vec<&str> = queue.unclaimed.iter().map(String::as_str).collect();
        assert_eq!(order, vec!["due", "queued", "retry"]);
        assert_eq!(queue.unclaimed.pop_back().as_deref(), Some("retry"));
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut queue = QueueState::default();
        queue
            .push_claimed("a", NOW - 4000, 0)
            .push_abandoned("old", NOW - PRUNE_AGE_SECS - 1)
            .push_delayed("later", NOW - 1);
        let mut with_jobs = BTreeSet::new();
        let p = params(3600, 3);

        let first = reclaim_queue(&mut queue, &mut with_jobs, &p);
        assert_eq!(first.affected(), 3);
        assert!(!queue.data.contains_key("old"));

        let second = reclaim_queue(&mut queue, &mut with_jobs, &p);
        assert_eq!(second.affected(), 0);
        assert_eq!(second.ready, 2);
    }

    #[test]
    fn test_empty_queue_is_dropped_from_set() {
        let mut queue = QueueState::default();
        let p = params(3600, 3);
        let mut with_jobs = BTreeSet::from([p.queue_id.clone()]);

        let counts = reclaim_queue(&mut queue, &mut with_jobs, &p);
        assert_eq!(counts, ReclaimCounts::default());
        assert!(with_jobs.is_empty());
    }

    #[test]
    fn test_batch_limit_bounds_each_scan() {
        let mut queue = QueueState::default();
        for i in 0..5 {
            queue.push_delayed(&format!("d{i}"), NOW - 100 + i);
        }
        let mut p = params(3600, 3);
        p.limit = 2;
        let mut with_jobs = BTreeSet::new();

        let counts = reclaim_queue(&mut queue, &mut with_jobs, &p);
        assert_eq!(counts.undelayed, 2);
        // oldest first
        assert!(!queue.delayed.contains_key("d0"));
        assert!(!queue.delayed.contains_key("d1"));
        assert!(queue.delayed.contains_key("d2"));
    }

    #[tokio::test]
    async fn test_lock_slot_expiry() {
        let store = MemoryStore::new(&["rdb1"]);
        assert!(store.acquire_lock_slot("l:0", 1000.0, 300.0).await.unwrap());
        assert!(!store.acquire_lock_slot("l:0", 1200.0, 300.0).await.unwrap());
        assert!(store.acquire_lock_slot("l:0", 1301.0, 300.0).await.unwrap());
        assert_eq!(store.lock_slot("l:0"), Some(1301.0));
    }
}
