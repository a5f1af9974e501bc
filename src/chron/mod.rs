//! Periodic reclamation daemon.
//!
//! Each cycle takes one slot of the fleet-wide pool lock, runs the
//! reclamation script on every queue of every partition, then republishes
//! the ready-queue map on the aggregators.
//!
//! ```text
//! idle -> lock-attempt -> raced                      -> idle
//!                      -> running -> publish -> unlock -> idle
//! ```

pub mod lock;
pub mod params;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::JobLimits;
use crate::error::StoreError;
use crate::stats::StatsClient;
use crate::store::keys::{encode_queue_name, EPOCH_FIELD};
use crate::store::{JobStore, ReclaimCounts};

pub use lock::{LockLease, PoolLock, LOCK_TTL_SECS, PERIODIC_TASKS_LOCK};
pub use params::ReclaimParamsIter;

/// Wait between cycles.
pub const PERIOD: Duration = Duration::from_secs(1);

/// Pause between two script calls.
pub const SCRIPT_PAUSE: Duration = Duration::from_millis(5);

/// The pool lock is re-stamped every this many queues.
pub const LOCK_REFRESH_INTERVAL: usize = 100;

/// Result of one sweep cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every lock slot was held by someone else.
    Raced,
    /// The sweep ran; `ok` is false if any partition or queue failed.
    Swept { jobs: u64, ok: bool },
    /// The locking bracket hit a total aggregator outage.
    Failed,
}

/// The chron service.
pub struct ChronService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    stats: StatsClient,
    limits: JobLimits,
    host: String,
    lock: PoolLock,
    period: Duration,
    script_pause: Duration,
}

impl ChronService {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        stats: StatsClient,
        limits: JobLimits,
        host: impl Into<String>,
    ) -> Self {
        let slots = store.partitions().len();
        let lock = PoolLock::new(store.clone(), clock.clone(), PERIODIC_TASKS_LOCK, slots);
        Self {
            store,
            clock,
            stats,
            limits,
            host: host.into(),
            lock,
            period: PERIOD,
            script_pause: SCRIPT_PAUSE,
        }
    }

    /// Overrides the pause between script calls.
    pub fn with_script_pause(mut self, pause: Duration) -> Self {
        self.script_pause = pause;
        self
    }

    /// Overrides the wait between cycles.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Runs cycles until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting job chron loop(s)...");

        // run out of phase immediately
        let phase = Duration::from_micros(rand::rng().random_range(0..=self.period.as_micros() as u64));
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(phase) => {}
        }

        self.stats.incr(&format!("start-chron.{}", self.host), 1);
        loop {
            if let CycleOutcome::Swept { jobs, .. } = self.run_cycle().await {
                if jobs > 0 {
                    info!("Updated the state of {} job(s) (recycle/undelay/abandon).", jobs);
                }
            }
            self.stats.flush().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        info!("Chron loop stopped");
        Ok(())
    }

    /// Runs one lock/sweep/publish/unlock cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        match self.locked_sweep().await {
            Ok(None) => {
                self.stats
                    .incr(&format!("periodictasks.raced.{}", self.host), 1);
                info!("Raced out of periodic tasks.");
                CycleOutcome::Raced
            }
            Ok(Some((jobs, ok))) => {
                if ok {
                    self.stats
                        .incr(&format!("periodictasks.done.{}", self.host), 1);
                } else {
                    self.stats
                        .incr(&format!("periodictasks.failed.{}", self.host), 1);
                    error!("Failed to do periodic tasks for some queues.");
                }
                CycleOutcome::Swept { jobs, ok }
            }
            Err(e) => {
                self.stats
                    .incr(&format!("periodictasks.failed.{}", self.host), 1);
                error!(error = %e, "Failed to do periodic tasks for some queues.");
                CycleOutcome::Failed
            }
        }
    }

    /// Returns `None` if raced, else the affected job count and whether
    /// every partition succeeded.
    async fn locked_sweep(&self) -> Result<Option<(u64, bool)>, StoreError> {
        let Some(lease) = self.lock.acquire().await? else {
            return Ok(None);
        };
        self.stats
            .incr(&format!("periodictasks.claimed.{}", self.host), 1);

        let mut partitions = self.store.partitions();
        // Randomize to scale the liveliness with the # of runners
        partitions.shuffle(&mut rand::rng());

        let mut ready_map: BTreeMap<String, i64> = BTreeMap::new();
        ready_map.insert(EPOCH_FIELD.to_string(), self.clock.now_secs());
        let mut jobs = 0u64;
        let mut checked = 0usize;
        let mut ok = true;

        for partition in &partitions {
            let swept = self
                .sweep_partition(partition, &lease, &mut ready_map, &mut jobs, &mut checked)
                .await?;
            if !swept {
                self.stats
                    .incr(&format!("periodictasks.partition-failed.{}", partition), 1);
                ok = false;
            }
        }

        // Brief races with other publishers are fixed by the next run.
        self.store.publish_ready_queues(&ready_map).await?;
        self.lock.release(lease).await?;

        Ok(Some((jobs, ok)))
    }

    /// Sweeps every queue on `partition`. Returns false if the partition or
    /// any of its queues failed; errors only if the lock refresh failed.
    async fn sweep_partition(
        &self,
        partition: &str,
        lease: &LockLease,
        ready_map: &mut BTreeMap<String, i64>,
        jobs: &mut u64,
        checked: &mut usize,
    ) -> Result<bool, StoreError> {
        let queue_ids = match self.store.queues_with_jobs(partition).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(partition = %partition, error = %e, "Could not list queues with jobs");
                return Ok(false);
            }
        };
        debug!(partition = %partition, queues = queue_ids.len(), "Sweeping partition");

        let params = ReclaimParamsIter::new(
            queue_ids,
            &mut rand::rng(),
            &self.limits,
            self.clock.as_ref(),
        );

        let mut ok = true;
        let mut by_type: HashMap<String, ReclaimCounts> = HashMap::new();
        for p in params {
            match self.store.reclaim(partition, &p).await {
                Ok(counts) => {
                    if counts.ready > 0 {
                        ready_map.insert(encode_queue_name(&p.job_type, &p.domain), self.clock.now_secs());
                    }
                    *jobs += counts.affected();
                    let total = by_type.entry(p.job_type).or_default();
                    total.released += counts.released;
                    total.abandoned += counts.abandoned;
                    total.undelayed += counts.undelayed;
                    total.pruned += counts.pruned;
                }
                Err(e) => {
                    debug!(partition = %partition, queue = %p.queue_id, error = %e, "Reclaim failed");
                    ok = false;
                }
            }

            if !self.script_pause.is_zero() {
                tokio::time::sleep(self.script_pause).await;
            }

            *checked += 1;
            if *checked % LOCK_REFRESH_INTERVAL == 0 {
                self.lock.refresh(lease).await?;
            }
        }

        for (job_type, total) in by_type {
            self.stats
                .incr(&format!("job-recycle.{}", job_type), total.released as i64);
            self.stats
                .incr(&format!("job-abandon.{}", job_type), total.abandoned as i64);
            self.stats
                .incr(&format!("job-undelay.{}", job_type), total.undelayed as i64);
            self.stats
                .incr(&format!("job-prune.{}", job_type), total.pruned as i64);
        }

        Ok(ok)
    }
}
