//! Runner scheduler daemon.
//!
//! Each configured group is a loop of dispatcher slots with its own
//! high/low priority state. Every tick reads the pending queue map, moves
//! each loop's priority forward in time, then polls and refills its slots.

pub mod command;
pub mod pending;
pub mod priority;
pub mod process;
pub mod result;
pub mod select;
pub mod slot;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{PriorityWindows, RunnerGroup, ServiceConfig};
use crate::stats::StatsClient;
use crate::store::JobStore;

pub use pending::{PendingQueues, ReadyQueueCache};
pub use priority::LoopPriority;
pub use process::{ChildProcess, ProcessSpawner, ProcessStatus, ShellSpawner};
pub use result::DispatcherResult;
pub use slot::{RefillOutcome, SlotPipeline};

/// Back-off when there is nothing to do.
pub const IDLE_WAIT: Duration = Duration::from_millis(100);

/// What one scheduler tick found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No queue has pending work.
    Idle,
    /// Every slot of every loop is busy.
    AllFull,
    /// Some slots are free but no eligible queue was found.
    NoEligibleQueue,
    /// New dispatchers were started.
    Spawned(usize),
}

impl TickOutcome {
    /// Whether the main loop should sleep before the next tick.
    pub fn should_back_off(&self) -> bool {
        !matches!(self, TickOutcome::Spawned(_))
    }
}

/// The runner service.
pub struct RunnerService {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    stats: StatsClient,
    groups: Vec<RunnerGroup>,
    windows: PriorityWindows,
    priorities: Vec<LoopPriority>,
    pipeline: SlotPipeline,
    cache: ReadyQueueCache,
    rng: StdRng,
    host: String,
    idle_wait: Duration,
}

impl RunnerService {
    pub fn new(
        config: &ServiceConfig,
        store: Arc<dyn JobStore>,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        stats: StatsClient,
        host: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let now = clock.now_secs();
        let priorities = config
            .groups
            .iter()
            .map(|_| LoopPriority::new(rng.random_bool(0.5), now))
            .collect();
        for group in &config.groups {
            info!("Initialized loop {} with {} runner(s).", group.name, group.runners);
        }
        let pipeline = SlotPipeline::new(
            &config.groups,
            spawner,
            clock.clone(),
            stats.clone(),
            config.limits.clone(),
            config.priority,
            config.dispatcher.clone(),
            host.clone(),
        );
        Self {
            store,
            clock,
            stats,
            groups: config.groups.clone(),
            windows: config.priority,
            priorities,
            pipeline,
            cache: ReadyQueueCache::default(),
            rng,
            host,
            idle_wait: IDLE_WAIT,
        }
    }

    /// Replaces the random source.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Sets the priority state of every loop.
    pub fn with_priorities(mut self, high: bool) -> Self {
        let now = self.clock.now_secs();
        for prio in &mut self.priorities {
            *prio = LoopPriority::new(high, now);
        }
        self
    }

    pub fn priorities(&self) -> &[LoopPriority] {
        &self.priorities
    }

    pub fn pipeline(&self) -> &SlotPipeline {
        &self.pipeline
    }

    /// Runs ticks until `shutdown` is cancelled, then sends SIGTERM to every
    /// live dispatcher.
    pub async fn run(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting job spawner loop(s)...");
        self.stats.incr(&format!("start-runner.{}", self.host), 1);

        while !shutdown.is_cancelled() {
            let outcome = self.tick().await;
            self.stats.flush().await;

            if outcome.should_back_off() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_wait) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        let signaled = self.pipeline.terminate_all();
        info!(processes = signaled, "Runner loop stopped");
        Ok(())
    }

    /// One scheduling pass over every loop.
    pub async fn tick(&mut self) -> TickOutcome {
        let pending = self.cache.get(self.store.as_ref(), self.clock.now()).await;
        if pending.is_empty() {
            debug!("No jobs available...");
            self.stats.incr(&format!("idle.{}", self.host), 1);
            return TickOutcome::Idle;
        }

        let mut switches = 0;
        let mut any_free = 0;
        let mut any_new = 0;
        for (loop_id, group) in self.groups.iter().enumerate() {
            debug!("Checking runner loop {}...", group.name);
            let prio = &mut self.priorities[loop_id];

            // Implement high/low priority via time-sharing
            if prio.advance(self.clock.now_secs(), &self.windows) {
                debug!("Runner loop {} now in {} priority.", group.name, prio.label());
                switches += 1;
            }

            let RefillOutcome { free, new } = self
                .pipeline
                .refill_slots(loop_id, group, *prio, pending, &mut self.rng)
                .await;
            any_free += free;
            any_new += new;

            // Rotate the priority from high/low and back if no jobs were found
            if free == 0 {
                debug!("Runner loop {} is full.", group.name);
            } else if new == 0 {
                prio.flip(self.clock.now_secs());
                debug!("Runner loop {} now in {} priority.", group.name, prio.label());
                debug!("Runner loop {} has no jobs.", group.name);
                switches += 1;
            } else {
                debug!("Done checking loop {}.", group.name);
            }
        }

        self.stats
            .incr(&format!("spawn.{}", self.host), any_new as i64);
        self.stats
            .incr(&format!("prioritychange.{}", self.host), switches);

        if any_free == 0 {
            debug!("All runner loops full.");
            self.stats.incr(&format!("all-full.{}", self.host), 1);
            TickOutcome::AllFull
        } else if any_new == 0 {
            debug!("Loops have free slots, but there are no appropriate jobs.");
            self.stats.incr(&format!("some-full.{}", self.host), 1);
            TickOutcome::NoEligibleQueue
        } else {
            TickOutcome::Spawned(any_new)
        }
    }
}
