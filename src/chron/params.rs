//! Lazy per-queue script arguments for one partition sweep.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;

use crate::clock::Clock;
use crate::config::JobLimits;
use crate::store::keys::parse_queue_set_member;
use crate::store::{ReclaimParams, PRUNE_AGE_SECS, RECLAIM_BATCH_LIMIT};

/// Single-pass iterator yielding [`ReclaimParams`] for shuffled queue ids.
///
/// Cutoffs are computed from the clock as each item is produced, so a long
/// sweep never works from a stale `now`. Unparseable set members are skipped.
pub struct ReclaimParamsIter<'a> {
    ids: std::vec::IntoIter<String>,
    limits: &'a JobLimits,
    clock: &'a dyn Clock,
}

impl<'a> ReclaimParamsIter<'a> {
    pub fn new<R: Rng + ?Sized>(
        mut ids: Vec<String>,
        rng: &mut R,
        limits: &'a JobLimits,
        clock: &'a dyn Clock,
    ) -> Self {
        ids.shuffle(rng);
        Self {
            ids: ids.into_iter(),
            limits,
            clock,
        }
    }

    fn build(&self, queue_id: String, job_type: String, domain: String) -> ReclaimParams {
        let now = self.clock.now_secs();
        let claim_ttl = *self.limits.claim_ttl.for_type(&job_type) as i64;
        let max_attempts = *self.limits.attempts.for_type(&job_type);
        ReclaimParams {
            queue_id,
            claim_cutoff: now - claim_ttl,
            prune_cutoff: now - PRUNE_AGE_SECS,
            max_attempts,
            now,
            limit: RECLAIM_BATCH_LIMIT,
            job_type,
            domain,
        }
    }
}

impl Iterator for ReclaimParamsIter<'_> {
    type Item = ReclaimParams;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let queue_id = self.ids.next()?;
            match parse_queue_set_member(&queue_id) {
                Ok((job_type, domain)) => return Some(self.build(queue_id, job_type, domain)),
                Err(e) => warn!(queue = %queue_id, error = %e, "Skipping malformed queue id"),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.ids.size_hint().1)
    }
}
