//! Runner slots and the refill pass.
//!
//! A slot goes idle -> spawned -> running -> terminated -> idle. Each refill
//! pass polls every slot of a loop in index order, handles finished or
//! overdue dispatchers, and spawns new ones into free slots.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::{JobLimits, PriorityWindows, RunnerGroup};
use crate::stats::StatsClient;

use super::command::{build_command, DispatchArgs};
use super::pending::{remove_pending, PendingQueues};
use super::priority::LoopPriority;
use super::process::{ChildProcess, ProcessSpawner, ProcessStatus};
use super::result::DispatcherResult;
use super::select::select_queue;

/// Seconds after SIGTERM before an overdue dispatcher gets SIGKILL.
pub const KILL_GRACE_SECS: i64 = 5;

/// Longest error output quoted in logs, in characters.
pub const MAX_ERROR_CHARS: usize = 4096;

/// Bound on reading the remaining output of an exited dispatcher.
const OUTPUT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One dispatcher execution context.
#[derive(Default)]
pub struct Slot {
    child: Option<Box<dyn ChildProcess>>,
    domain: String,
    job_type: String,
    command: String,
    started: i64,
    signaled: Option<i64>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Slot {
    pub fn is_busy(&self) -> bool {
        self.child.is_some()
    }

    /// The `(type, domain)` the slot is working on, if busy.
    pub fn queue(&self) -> Option<(&str, &str)> {
        self.child
            .as_ref()
            .map(|_| (self.job_type.as_str(), self.domain.as_str()))
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Slots and free/new tallies of one refill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillOutcome {
    /// Slots found free (or freed) during the pass.
    pub free: usize,
    /// Spawn attempts made, successful or not.
    pub new: usize,
}

/// Everything a refill pass needs besides the slots themselves.
struct Dispatch {
    spawner: Arc<dyn ProcessSpawner>,
    clock: Arc<dyn Clock>,
    stats: StatsClient,
    limits: JobLimits,
    windows: PriorityWindows,
    template: String,
    host: String,
}

/// All slots of all loops.
pub struct SlotPipeline {
    dispatch: Dispatch,
    loops: Vec<Vec<Slot>>,
}

impl SlotPipeline {
    /// Creates `runners` idle slots for each group.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        groups: &[RunnerGroup],
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        stats: StatsClient,
        limits: JobLimits,
        windows: PriorityWindows,
        template: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        let loops = groups
            .iter()
            .map(|g| (0..g.runners).map(|_| Slot::default()).collect())
            .collect();
        Self {
            dispatch: Dispatch {
                spawner,
                clock,
                stats,
                limits,
                windows,
                template: template.into(),
                host: host.into(),
            },
            loops,
        }
    }

    pub fn slots(&self, loop_id: usize) -> &[Slot] {
        self.loops.get(loop_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of slots with a live dispatcher.
    pub fn busy_count(&self) -> usize {
        self.loops.iter().flatten().filter(|s| s.is_busy()).count()
    }

    /// Polls and refills the slots of `loop_id`.
    ///
    /// Stops at the first free slot for which no queue is eligible.
    pub async fn refill_slots<R: Rng + ?Sized>(
        &mut self,
        loop_id: usize,
        group: &RunnerGroup,
        priority: LoopPriority,
        pending: &mut PendingQueues,
        rng: &mut R,
    ) -> RefillOutcome {
        let mut outcome = RefillOutcome::default();
        let Some(slots) = self.loops.get_mut(loop_id) else {
            return outcome;
        };
        let dispatch = &self.dispatch;
        let now = dispatch.clock.now_secs();

        for (index, slot) in slots.iter_mut().enumerate() {
            if !dispatch.poll_slot(&group.name, index, slot, now, pending).await {
                // slot is busy
                continue;
            }
            outcome.free += 1;

            let Some((job_type, domain)) = select_queue(group, priority.high, pending, rng) else {
                break;
            };
            dispatch.spawn(&group.name, index, slot, priority, job_type, domain, now);
            outcome.new += 1;
        }
        outcome
    }

    /// Sends SIGTERM to every live dispatcher and forgets it.
    ///
    /// Returns the number of processes signaled.
    pub fn terminate_all(&mut self) -> usize {
        let mut signaled = 0;
        for slot in self.loops.iter_mut().flatten() {
            let Some(mut child) = slot.child.take() else {
                continue;
            };
            if let Some(pid) = child.id() {
                info!("Sending SIGTERM to {}.", pid);
            }
            if let Err(e) = child.terminate(false) {
                error!(error = %e, "Could not terminate dispatcher");
            }
            signaled += 1;
            slot.reset();
        }
        signaled
    }
}

impl Dispatch {
    /// Handles the current state of a slot. Returns true if the slot is free
    /// afterwards.
    async fn poll_slot(
        &self,
        loop_name: &str,
        index: usize,
        slot: &mut Slot,
        now: i64,
        pending: &mut PendingQueues,
    ) -> bool {
        let Some(child) = slot.child.as_mut() else {
            return true;
        };

        let status = child.try_status();
        if status.is_ok() {
            // Keep reading in any output to avoid process lockups
            child.drain_output(&mut slot.stdout, &mut slot.stderr);
        }

        match status {
            Ok(ProcessStatus::Running) => {
                let max_real = *self.limits.max_real.for_type(&slot.job_type) as i64;
                let age = now - slot.started;
                if age < max_real {
                    return false;
                }
                let signaled = slot.signaled;
                match signaled {
                    None => {
                        error!(
                            "Runner loop {} process in slot {} timed out [{}s; max: {}s]:\n{}",
                            loop_name, index, age, max_real, slot.command
                        );
                        if let Err(e) = child.terminate(false) {
                            error!(error = %e, "Could not send SIGTERM");
                        }
                        slot.signaled = Some(now);
                        self.stats.incr("runner-status.timeout", 1);
                        false
                    }
                    Some(at) if now - at > KILL_GRACE_SECS => {
                        error!("Runner loop {} process in slot {} sent SIGKILL.", loop_name, index);
                        if let Err(e) = child.terminate(true) {
                            error!(error = %e, "Could not send SIGKILL");
                        }
                        self.close_slot(loop_name, index, slot).await;
                        self.stats.incr("runner-status.kill", 1);
                        true
                    }
                    Some(_) => false,
                }
            }
            Ok(ProcessStatus::Exited(code)) => {
                child
                    .collect_output(&mut slot.stdout, &mut slot.stderr, OUTPUT_READ_TIMEOUT)
                    .await;
                self.handle_exit(loop_name, index, slot, code, now, pending);
                self.close_slot(loop_name, index, slot).await;
                true
            }
            Err(e) => {
                error!(error = %e, "Runner loop {} process in slot {} gave no status.", loop_name, index);
                self.close_slot(loop_name, index, slot).await;
                self.stats.incr("runner-status.none", 1);
                true
            }
        }
    }

    fn handle_exit(
        &self,
        loop_name: &str,
        index: usize,
        slot: &Slot,
        code: Option<i32>,
        now: i64,
        pending: &mut PendingQueues,
    ) {
        let stdout = String::from_utf8_lossy(&slot.stdout);
        let parsed = DispatcherResult::parse(&stdout);

        match (code, &parsed) {
            (Some(0), Ok(result)) => {
                // If this finished early, lay off of the queue for a while
                let run_time = (now - slot.started) as f64;
                if run_time < self.windows.hp_max_time as f64 / 2.0 {
                    remove_pending(pending, &slot.job_type, &slot.domain);
                    debug!("Queue '{}/{}' emptied.", slot.domain, slot.job_type);
                }
                let (ok, failed) = result.tally();
                self.stats
                    .incr(&format!("pop.{}.ok.{}", slot.job_type, self.host), ok as i64);
                self.stats
                    .incr(&format!("pop.{}.failed.{}", slot.job_type, self.host), failed as i64);
            }
            _ => {
                let extra = match &parsed {
                    Err(e) => format!("JSON decode error: {}\n", e),
                    Ok(_) => String::new(),
                };
                let (label, output) = if slot.stderr.is_empty() {
                    ("STDOUT", stdout.into_owned())
                } else {
                    ("STDERR", String::from_utf8_lossy(&slot.stderr).into_owned())
                };
                let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                error!(
                    "Runner loop {} process in slot {} gave status '{}':\n{}{} {}:\n\t{}",
                    loop_name,
                    index,
                    status,
                    extra,
                    slot.command,
                    label,
                    truncate_error(&output)
                );
                self.stats.incr("runner-status.error", 1);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        loop_name: &str,
        index: usize,
        slot: &mut Slot,
        priority: LoopPriority,
        job_type: String,
        domain: String,
        now: i64,
    ) {
        let maxtime = priority.dispatcher_max_time(&self.windows);
        let maxmem = self.limits.max_memory.for_type(&job_type);
        let command = build_command(
            &self.template,
            &DispatchArgs {
                domain: &domain,
                job_type: &job_type,
                maxtime,
                maxmem,
            },
        );

        debug!(
            "Spawning runner in loop {} at slot {} ({}, {}):\n\t{}.",
            loop_name, index, job_type, domain, command
        );

        slot.reset();
        match self.spawner.spawn(&command) {
            Ok(child) => slot.child = Some(child),
            Err(e) => {
                error!(error = %e, "Could not spawn process in loop {}: {}", loop_name, command);
                self.stats.incr("runner-status.error", 1);
            }
        }
        slot.domain = domain;
        slot.job_type = job_type;
        slot.command = command;
        slot.started = now;
    }

    async fn close_slot(&self, loop_name: &str, index: usize, slot: &mut Slot) {
        if let Some(mut child) = slot.child.take() {
            debug!("Closing process in loop {} at slot {}.", loop_name, index);
            child.close().await;
        }
        slot.reset();
    }
}

/// Cuts error output to [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(output: &str) -> String {
    if output.len() <= MAX_ERROR_CHARS {
        return output.to_string();
    }
    let mut cut: String = output.chars().take(MAX_ERROR_CHARS).collect();
    cut.push_str("...");
    cut
}
