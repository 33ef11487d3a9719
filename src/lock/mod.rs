//! Mutual exclusion with leases, local or fleet-wide.
//!
//! Components that must not run concurrently (cache reloads, per-account
//! mutations) take a named lock through [`LockService`]. Two
//! implementations share the trait: [`LocalLockService`] for
//! single-instance deployments, and [`DistributedLockService`], which
//! holds leases in the shared store and enforces the single-holder
//! invariant across processes. Deployments pick one at startup via
//! [`LockMode`](crate::LockMode); callers never see the difference.
//!
//! The contract, for both:
//!
//! - **Contention is a value.** `try_lock` answers `false` when the lock
//!   could not be taken within the wait bound; it never errors.
//! - **Leases bound every hold.** A holder that dies without releasing
//!   blocks others only until its lease expires.
//! - **Reentrant per thread.** A thread holding a lock may take it again;
//!   releases must balance acquisitions.
//! - **Misuse is logged, not fatal.** A release by a non-holder is a
//!   caller bug, reported in the log and otherwise ignored.

mod distributed;
mod local;

use std::sync::Arc;
use std::time::Duration;

pub use distributed::DistributedLockService;
pub use local::LocalLockService;

use crate::config::LockMode;
use crate::error::AdmissionError;
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Lease applied when a policy does not name one. Long enough for any
/// reasonable critical section, short enough that a dead holder does not
/// wedge a key for long.
const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// How an acquisition behaves: how long to wait, how long the lease runs,
/// and whether contenders are served in arrival order.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    /// Maximum time to wait for the lock. Zero probes without blocking.
    pub wait: Duration,
    /// Lease duration; the lock self-releases this long after acquisition
    /// if the holder never releases. `None` applies a 30 s default.
    pub lease: Option<Duration>,
    /// Hand the lock to waiters in arrival order. Honored strictly by the
    /// local service; the distributed service serves waiters best-effort
    /// regardless. Fairness is fixed by the first acquisition of a key.
    pub fair: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            lease: None,
            fair: false,
        }
    }
}

impl LockPolicy {
    /// The lease to apply, with the default filled in.
    pub(crate) fn effective_lease(&self) -> Duration {
        self.lease.unwrap_or(DEFAULT_LEASE)
    }
}

/// Named, leased mutual exclusion.
///
/// Keys are free-form strings chosen by the caller; two callers using the
/// same key on the same service contend for the same lock.
pub trait LockService: Send + Sync + std::fmt::Debug {
    /// Attempts to take the lock for `key` under `policy`.
    ///
    /// Returns whether the lock is now held by the calling thread. Never
    /// errors: infrastructure failure in a distributed implementation
    /// reports as `false` (fail closed).
    fn try_lock(&self, key: &str, policy: &LockPolicy) -> bool;

    /// Releases one hold on `key` by the calling thread.
    ///
    /// A release by a thread that does not hold the lock is logged and
    /// ignored.
    fn unlock(&self, key: &str);

    /// Releases `key` unconditionally, whoever holds it. A recovery
    /// hatch for operators; normal code paths release through
    /// [`unlock`](Self::unlock).
    fn force_unlock(&self, key: &str);

    /// Whether `key` is currently held (by anyone). Advisory: the answer
    /// can be stale by the time the caller acts on it.
    fn is_locked(&self, key: &str) -> bool;
}

/// Builds the [`LockService`] implementation a configuration names:
/// in-process locks for [`LockMode::Local`], store-backed leases for
/// [`LockMode::Distributed`].
pub fn lock_service_for(
    mode: LockMode,
    store: Arc<dyn SharedStore>,
    metrics: Arc<dyn MetricsSink>,
) -> Arc<dyn LockService> {
    match mode {
        LockMode::Local => Arc::new(LocalLockService::new(metrics)),
        LockMode::Distributed => Arc::new(DistributedLockService::new(store, metrics)),
    }
}

/// Runs `f` under the lock for `key`, releasing it afterwards on every
/// path, panic included.
///
/// Returns [`AdmissionError::LockUnavailable`] when the lock could not be
/// taken within the policy's wait bound; `f` is not invoked in that case.
///
/// # Example
///
/// ```rust
/// use turnstile::{with_lock, LocalLockService, LockPolicy, NoopMetrics};
/// use std::sync::Arc;
///
/// let locks = LocalLockService::new(Arc::new(NoopMetrics));
/// let n = with_lock(&locks, "account:42", &LockPolicy::default(), || 2 + 2)?;
/// assert_eq!(n, 4);
/// # Ok::<(), turnstile::AdmissionError>(())
/// ```
pub fn with_lock<T>(
    service: &dyn LockService,
    key: &str,
    policy: &LockPolicy,
    f: impl FnOnce() -> T,
) -> Result<T, AdmissionError> {
    if !service.try_lock(key, policy) {
        return Err(AdmissionError::LockUnavailable { key: key.to_string() });
    }
    let _guard = UnlockGuard { service, key };
    Ok(f())
}

struct UnlockGuard<'a> {
    service: &'a dyn LockService,
    key: &'a str,
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        self.service.unlock(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::Arc;

    #[test]
    fn test_with_lock_releases_on_success() {
        let locks = LocalLockService::new(Arc::new(NoopMetrics));
        let policy = LockPolicy::default();

        let n = with_lock(&locks, "k", &policy, || 41 + 1).unwrap();
        assert_eq!(n, 42);

        // Released: an immediate non-blocking retake succeeds.
        let probe = LockPolicy { wait: Duration::ZERO, ..LockPolicy::default() };
        assert!(locks.try_lock("k", &probe));
        locks.unlock("k");
    }

    #[test]
    fn test_with_lock_releases_on_panic() {
        let locks = Arc::new(LocalLockService::new(Arc::new(NoopMetrics)));
        let policy = LockPolicy::default();

        let caught = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                let _ = with_lock(&*locks, "k", &LockPolicy::default(), || {
                    panic!("loader blew up")
                });
            })
            .join()
        };
        assert!(caught.is_err());

        let probe = LockPolicy { wait: Duration::ZERO, ..policy };
        assert!(locks.try_lock("k", &probe));
        locks.unlock("k");
    }

    #[test]
    fn test_lock_service_for_honors_mode() {
        let store: Arc<dyn SharedStore> = Arc::new(crate::InMemoryStore::new());
        let local = lock_service_for(LockMode::Local, store.clone(), Arc::new(NoopMetrics));
        let distributed =
            lock_service_for(LockMode::Distributed, store.clone(), Arc::new(NoopMetrics));

        // The distributed service leaves a lease entry in the store; the
        // local one does not.
        assert!(local.try_lock("k", &LockPolicy::default()));
        assert!(store.get("lock:k").unwrap().is_none());
        local.unlock("k");

        assert!(distributed.try_lock("k", &LockPolicy::default()));
        assert!(store.get("lock:k").unwrap().is_some());
        distributed.unlock("k");
    }

    #[test]
    fn test_with_lock_surfaces_unavailability() {
        let locks = LocalLockService::new(Arc::new(NoopMetrics));
        let probe = LockPolicy { wait: Duration::ZERO, ..LockPolicy::default() };

        assert!(locks.try_lock("k", &probe));

        let other = std::thread::scope(|s| {
            s.spawn(|| with_lock(&locks, "k", &probe, || ())).join().unwrap()
        });
        assert!(matches!(
            other,
            Err(AdmissionError::LockUnavailable { key }) if key == "k"
        ));

        locks.unlock("k");
    }
}
