//! Lock service holding leases in the shared store.
//!
//! One store entry per held lock: `set_if_absent` with the lease as TTL is
//! the acquire, and an owner-checked conditional delete is the release, so
//! a process can never free a lock it lost to lease expiry. The owner
//! token embeds a per-service random identity plus the thread and a
//! per-acquisition nonce.
//!
//! Unlike rate limiting, locking fails *closed*: when the store cannot be
//! reached, `try_lock` answers `false`. Granting mutual exclusion without
//! the store's say-so could let two processes mutate the same account.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::lock::{LockPolicy, LockService};
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Namespace prefix of lock entries in the shared store.
const KEY_PREFIX: &str = "lock:";

/// Cadence of acquisition retries while blocked. There is no cross-process
/// wake-up, so contenders poll.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Hold {
    thread: ThreadId,
    count: u32,
    token: Vec<u8>,
}

/// [`LockService`] backed by the shared store. See the [module docs](self).
///
/// Reentrancy is tracked locally per key; only the first acquisition and
/// the final release touch the store.
#[derive(Debug)]
pub struct DistributedLockService {
    store: Arc<dyn SharedStore>,
    metrics: Arc<dyn MetricsSink>,
    /// Random per-service identity, distinguishing processes (and service
    /// instances within one process).
    identity: u64,
    next_nonce: AtomicU64,
    holds: DashMap<String, Hold, ahash::RandomState>,
}

impl DistributedLockService {
    /// Creates a service over `store` with a fresh random identity.
    pub fn new(store: Arc<dyn SharedStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            identity: rand::random(),
            next_nonce: AtomicU64::new(0),
            holds: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    fn owner_token(&self, thread: ThreadId) -> Vec<u8> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}:{:016x}:{thread:?}:{nonce}",
            std::process::id(),
            self.identity
        )
        .into_bytes()
    }
}

impl LockService for DistributedLockService {
    fn try_lock(&self, key: &str, policy: &LockPolicy) -> bool {
        let me = thread::current().id();
        let start = Instant::now();

        if let Some(mut hold) = self.holds.get_mut(key) {
            if hold.thread == me {
                hold.count += 1;
                self.metrics.record_lock_acquire(true, start.elapsed());
                return true;
            }
        }

        let store_key = format!("{KEY_PREFIX}{key}");
        let token = self.owner_token(me);
        let lease = policy.effective_lease();
        let deadline = start + policy.wait;

        loop {
            match self.store.set_if_absent(&store_key, &token, Some(lease)) {
                Ok(true) => {
                    self.holds.insert(
                        key.to_string(),
                        Hold { thread: me, count: 1, token },
                    );
                    debug!(key, "distributed lock acquired");
                    self.metrics.record_lock_acquire(true, start.elapsed());
                    return true;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(key, %err, "shared store unavailable, lock not granted");
                    self.metrics.record_lock_acquire(false, start.elapsed());
                    return false;
                }
            }

            if Instant::now() + RETRY_INTERVAL > deadline {
                self.metrics.record_lock_acquire(false, start.elapsed());
                return false;
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    fn unlock(&self, key: &str) {
        let me = thread::current().id();
        let token = {
            let Some(mut hold) = self.holds.get_mut(key) else {
                warn!(key, "unlock of lock not held by this process ignored");
                return;
            };
            if hold.thread != me {
                warn!(key, "unlock by non-holder ignored");
                return;
            }
            hold.count -= 1;
            if hold.count > 0 {
                self.metrics.record_lock_release();
                return;
            }
            hold.token.clone()
        };
        self.holds.remove(key);

        let store_key = format!("{KEY_PREFIX}{key}");
        match self.store.delete_if_equals(&store_key, &token) {
            Ok(true) => debug!(key, "distributed lock released"),
            // Lease already expired (and perhaps re-acquired elsewhere);
            // deleting unconditionally here would free someone else's lock.
            Ok(false) => warn!(key, "lease expired before release"),
            Err(err) => warn!(key, %err, "store unavailable during release, lease will expire"),
        }
        self.metrics.record_lock_release();
    }

    fn force_unlock(&self, key: &str) {
        self.holds.remove(key);
        match self.store.delete(&format!("{KEY_PREFIX}{key}")) {
            Ok(true) => warn!(key, "distributed lock force-released"),
            Ok(false) => {}
            Err(err) => warn!(key, %err, "store unavailable during force release"),
        }
    }

    fn is_locked(&self, key: &str) -> bool {
        match self.store.get(&format!("{KEY_PREFIX}{key}")) {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                warn!(key, %err, "store unavailable, reporting lock as free");
                false
            }
        }
    }
}
