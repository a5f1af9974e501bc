//! Fleet-wide pool lock for the periodic sweep.
//!
//! The lock is a bounded semaphore of `slots` lease keys on the aggregators.
//! A slot is free once its stored timestamp is older than the TTL; holders
//! re-stamp it while working and delete it when done.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::keys::pool_lock_key;
use crate::store::JobStore;

/// Name of the sweep's critical section.
pub const PERIODIC_TASKS_LOCK: &str = "jobchron:periodic-tasks";

/// Lease lifetime of a lock slot, in seconds.
pub const LOCK_TTL_SECS: f64 = 300.0;

/// A held lock slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub slot: usize,
}

/// Lease-based pool lock with `slots` holders at most.
pub struct PoolLock {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    name: String,
    slots: usize,
    ttl: f64,
}

impl PoolLock {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, name: &str, slots: usize) -> Self {
        Self {
            store,
            clock,
            name: name.to_string(),
            slots,
            ttl: LOCK_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Takes the first free slot, or returns `None` if every slot is held.
    pub async fn acquire(&self) -> Result<Option<LockLease>, StoreError> {
        for slot in 0..self.slots {
            let key = pool_lock_key(&self.name, slot);
            if self
                .store
                .acquire_lock_slot(&key, self.clock.now(), self.ttl)
                .await?
            {
                debug!(key = %key, "Acquired pool lock slot");
                return Ok(Some(LockLease { key, slot }));
            }
        }
        Ok(None)
    }

    /// Extends the lease of a held slot.
    pub async fn refresh(&self, lease: &LockLease) -> Result<(), StoreError> {
        self.store.refresh_lock_slot(&lease.key, self.clock.now()).await
    }

    /// Gives a slot back.
    pub async fn release(&self, lease: LockLease) -> Result<bool, StoreError> {
        self.store.release_lock_slot(&lease.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;

    fn setup(slots: usize) -> (Arc<MemoryStore>, Arc<ManualClock>, PoolLock) {
        let store = Arc::new(MemoryStore::new(&["rdb1", "rdb2"]));
        let clock = Arc::new(ManualClock::new(1_700_000_000.0));
        let lock = PoolLock::new(store.clone(), clock.clone(), PERIODIC_TASKS_LOCK, slots);
        (store, clock, lock)
    }

    #[tokio::test]
    async fn test_at_most_slots_holders() {
        let (_store, _clock, lock) = setup(2);

        let mut held = Vec::new();
        for _ in 0..5 {
            if let Some(lease) = lock.acquire().await.unwrap() {
                held.push(lease);
            }
        }
        assert_eq!(held.len(), 2);
        assert_eq!(held[0].key, "jobchron:periodic-tasks:lock:0");
        assert_eq!(held[1].key, "jobchron:periodic-tasks:lock:1");
    }

    #[tokio::test]
    async fn test_concurrent_attempts_bounded() {
        let (_store, _clock, lock) = setup(3);
        let lock = Arc::new(lock);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move { lock.acquire().await.unwrap() }));
        }
        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                won += 1;
            }
        }
        assert_eq!(won, 3);
    }

    #[tokio::test]
    async fn test_expired_slot_is_taken_over() {
        let (store, clock, lock) = setup(1);

        let first = lock.acquire().await.unwrap().unwrap();
        assert!(lock.acquire().await.unwrap().is_none());

        clock.advance(LOCK_TTL_SECS + 1.0);
        let second = lock.acquire().await.unwrap().unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(store.lock_slot(&second.key), Some(clock.now()));
    }

    #[tokio::test]
    async fn test_refresh_keeps_lease_alive() {
        let (_store, clock, lock) = setup(1);
        let lease = lock.acquire().await.unwrap().unwrap();

        clock.advance(LOCK_TTL_SECS - 10.0);
        lock.refresh(&lease).await.unwrap();
        clock.advance(20.0);
        assert!(lock.acquire().await.unwrap().is_none());

        assert!(lock.release(lease).await.unwrap());
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acquire_fails_when_aggregators_down() {
        let (store, _clock, lock) = setup(1);
        store.set_aggregators_down(true);
        assert!(lock.acquire().await.unwrap_err().is_total_outage());
    }
}
