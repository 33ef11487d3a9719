//! In-process lock service with leased holds.
//!
//! One record per key: a mutex-guarded core holding the owner thread, the
//! reentrancy count, the lease deadline, and (in fair mode) a FIFO queue
//! of waiters, plus a condvar waiters park on. Lease expiry is enforced
//! twice over: a waiter re-checks the deadline whenever it wakes, and a
//! single shared sweeper thread reclaims expired holds that nobody is
//! waiting on, so an abandoned lock does not linger until the next
//! contender arrives.

use std::collections::{BinaryHeap, VecDeque};
use std::cmp::Reverse;
use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::lock::{LockPolicy, LockService};
use crate::metrics::MetricsSink;

#[derive(Debug, Default)]
struct LockCore {
    holder: Option<ThreadId>,
    hold_count: u32,
    /// Bumped on every ownership change; stale sweeper entries compare
    /// against it and stand down.
    generation: u64,
    deadline: Option<Instant>,
    queue: VecDeque<ThreadId>,
}

#[derive(Debug)]
struct LockRecord {
    core: Mutex<LockCore>,
    available: Condvar,
    fair: bool,
}

impl LockRecord {
    fn new(fair: bool) -> Self {
        Self {
            core: Mutex::new(LockCore::default()),
            available: Condvar::new(),
            fair,
        }
    }

    /// Reclaims the hold if its lease has expired. Caller holds the core.
    fn reclaim_if_expired(&self, core: &mut LockCore, key: &str, now: Instant) {
        if core.holder.is_some() && core.deadline.is_some_and(|d| d <= now) {
            warn!(key, "lock lease expired, reclaiming from holder");
            core.holder = None;
            core.hold_count = 0;
            core.deadline = None;
            core.generation += 1;
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SweepEntry {
    at: Instant,
    key: String,
    generation: u64,
}

enum SweepMsg {
    Schedule(SweepEntry),
    Shutdown,
}

type Records = Arc<DashMap<String, Arc<LockRecord>, ahash::RandomState>>;

/// In-process [`LockService`] with per-thread reentrancy, optional FIFO
/// fairness, and lease expiry. See the [module docs](self).
#[derive(Debug)]
pub struct LocalLockService {
    records: Records,
    metrics: Arc<dyn MetricsSink>,
    sweep_tx: mpsc::Sender<SweepMsg>,
    sweeper: Option<thread::JoinHandle<()>>,
}

impl LocalLockService {
    /// Creates the service and starts its expiry sweeper thread. The
    /// sweeper stops when the service is dropped.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        let records: Records = Arc::new(DashMap::with_hasher(ahash::RandomState::new()));
        let (sweep_tx, sweep_rx) = mpsc::channel();
        let sweeper = {
            let records = Arc::clone(&records);
            thread::Builder::new()
                .name("turnstile-lock-sweeper".to_string())
                .spawn(move || sweeper_loop(&records, &sweep_rx))
                .expect("failed to spawn lock sweeper thread")
        };
        Self {
            records,
            metrics,
            sweep_tx,
            sweeper: Some(sweeper),
        }
    }

    /// Number of keys with a lock record. Test/introspection helper.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no lock records exist.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Drop for LocalLockService {
    fn drop(&mut self) {
        let _ = self.sweep_tx.send(SweepMsg::Shutdown);
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }
}

impl LockService for LocalLockService {
    fn try_lock(&self, key: &str, policy: &LockPolicy) -> bool {
        let record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockRecord::new(policy.fair)))
            .value()
            .clone();

        let me = thread::current().id();
        let start = Instant::now();
        let wait_deadline = start + policy.wait;

        let mut core = record.core.lock();

        if core.holder == Some(me) {
            core.hold_count += 1;
            drop(core);
            self.metrics.record_lock_acquire(true, start.elapsed());
            return true;
        }

        if record.fair {
            core.queue.push_back(me);
        }

        loop {
            let now = Instant::now();
            record.reclaim_if_expired(&mut core, key, now);

            let my_turn = !record.fair || core.queue.front() == Some(&me);
            if core.holder.is_none() && my_turn {
                if record.fair {
                    core.queue.pop_front();
                }
                core.holder = Some(me);
                core.hold_count = 1;
                core.generation += 1;
                let lease_deadline = Instant::now() + policy.effective_lease();
                core.deadline = Some(lease_deadline);
                // Sweeper failure is tolerable: waiters re-check the
                // deadline themselves.
                let _ = self.sweep_tx.send(SweepMsg::Schedule(SweepEntry {
                    at: lease_deadline,
                    key: key.to_string(),
                    generation: core.generation,
                }));
                // The sink runs outside the critical section so a slow one
                // cannot stall other contenders.
                drop(core);
                self.metrics.record_lock_acquire(true, start.elapsed());
                return true;
            }

            // Wake at whichever comes first: our give-up point or the
            // holder's lease expiry.
            let until = core.deadline.map_or(wait_deadline, |d| wait_deadline.min(d));
            let timed_out = record.available.wait_until(&mut core, until).timed_out();
            if timed_out && Instant::now() >= wait_deadline {
                if record.fair {
                    core.queue.retain(|t| *t != me);
                }
                drop(core);
                self.metrics.record_lock_acquire(false, start.elapsed());
                return false;
            }
        }
    }

    fn unlock(&self, key: &str) {
        let me = thread::current().id();
        let Some(record) = self.records.get(key).map(|r| r.value().clone()) else {
            warn!(key, "unlock of unknown lock ignored");
            return;
        };

        let mut core = record.core.lock();
        if core.holder != Some(me) {
            warn!(key, "unlock by non-holder ignored");
            return;
        }

        core.hold_count -= 1;
        if core.hold_count == 0 {
            core.holder = None;
            core.deadline = None;
            core.generation += 1;
            debug!(key, "lock released");
            record.available.notify_all();
        }
        drop(core);
        self.metrics.record_lock_release();

        // One-shot keys (cache reloads) would otherwise accumulate records
        // forever.
        drop(record);
        gc_if_idle(&self.records, key);
    }

    fn force_unlock(&self, key: &str) {
        let Some(record) = self.records.get(key).map(|r| r.value().clone()) else {
            return;
        };
        let mut core = record.core.lock();
        if core.holder.is_some() {
            warn!(key, "lock force-released");
            core.holder = None;
            core.hold_count = 0;
            core.deadline = None;
            core.generation += 1;
            record.available.notify_all();
        }
    }

    fn is_locked(&self, key: &str) -> bool {
        let Some(record) = self.records.get(key).map(|r| r.value().clone()) else {
            return false;
        };
        let core = record.core.lock();
        core.holder.is_some() && !core.deadline.is_some_and(|d| d <= Instant::now())
    }
}

fn sweeper_loop(records: &Records, rx: &mpsc::Receiver<SweepMsg>) {
    let mut pending: BinaryHeap<Reverse<SweepEntry>> = BinaryHeap::new();
    loop {
        let timeout = pending
            .peek()
            .map(|Reverse(entry)| entry.at.saturating_duration_since(Instant::now()))
            .unwrap_or(std::time::Duration::from_secs(60));

        match rx.recv_timeout(timeout) {
            Ok(SweepMsg::Schedule(entry)) => pending.push(Reverse(entry)),
            Ok(SweepMsg::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while pending.peek().is_some_and(|Reverse(entry)| entry.at <= now) {
            let Reverse(entry) = pending.pop().expect("peeked entry present");
            expire(records, &entry, now);
        }
    }
}

fn expire(records: &Records, entry: &SweepEntry, now: Instant) {
    let Some(record) = records.get(&entry.key).map(|r| r.value().clone()) else {
        return;
    };
    let mut core = record.core.lock();
    // Only the hold this entry was scheduled for; later holders carry a
    // newer generation.
    if core.generation != entry.generation {
        return;
    }
    record.reclaim_if_expired(&mut core, &entry.key, now);
    record.available.notify_all();
    drop(core);

    // A hold reclaimed with nobody waiting usually means the holder died;
    // without this the key's record would linger forever.
    drop(record);
    gc_if_idle(records, &entry.key);
}

/// Drops the record for `key` if the map entry is its sole reference and
/// it is neither held nor waited on. A waiter always holds a clone, so a
/// record in use can never be removed.
fn gc_if_idle(records: &Records, key: &str) {
    records.remove_if(key, |_, rec| {
        Arc::strong_count(rec) == 1
            && rec
                .core
                .try_lock()
                .is_some_and(|core| core.holder.is_none() && core.queue.is_empty())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::time::Duration;

    fn service() -> LocalLockService {
        LocalLockService::new(Arc::new(NoopMetrics))
    }

    fn probe() -> LockPolicy {
        LockPolicy {
            wait: Duration::ZERO,
            ..LockPolicy::default()
        }
    }

    #[test]
    fn test_exclusive_while_held() {
        let locks = service();
        assert!(locks.try_lock("k", &probe()));

        thread::scope(|s| {
            let contender = s.spawn(|| locks.try_lock("k", &probe()));
            assert!(!contender.join().unwrap());
        });

        locks.unlock("k");
        thread::scope(|s| {
            let contender = s.spawn(|| {
                let got = locks.try_lock("k", &probe());
                if got {
                    locks.unlock("k");
                }
                got
            });
            assert!(contender.join().unwrap());
        });
    }

    #[test]
    fn test_reentrant_holds_balance() {
        let locks = service();
        assert!(locks.try_lock("k", &probe()));
        assert!(locks.try_lock("k", &probe()));

        locks.unlock("k");
        // Still held: one release remains outstanding.
        thread::scope(|s| {
            assert!(!s.spawn(|| locks.try_lock("k", &probe())).join().unwrap());
        });

        locks.unlock("k");
        thread::scope(|s| {
            let got = s.spawn(|| locks.try_lock("k", &probe())).join().unwrap();
            assert!(got);
        });
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let locks = Arc::new(service());
        assert!(locks.try_lock("k", &LockPolicy::default()));

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let policy = LockPolicy {
                    wait: Duration::from_secs(2),
                    ..LockPolicy::default()
                };
                let got = locks.try_lock("k", &policy);
                if got {
                    locks.unlock("k");
                }
                got
            })
        };

        thread::sleep(Duration::from_millis(100));
        locks.unlock("k");
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_lease_expiry_frees_abandoned_lock() {
        let locks = Arc::new(service());
        let short_lease = LockPolicy {
            wait: Duration::ZERO,
            lease: Some(Duration::from_millis(100)),
            fair: false,
        };
        // Acquire on a throwaway thread that never releases.
        {
            let locks = Arc::clone(&locks);
            let lease = short_lease.clone();
            thread::spawn(move || assert!(locks.try_lock("k", &lease)))
                .join()
                .unwrap();
        }

        let policy = LockPolicy {
            wait: Duration::from_millis(600),
            ..LockPolicy::default()
        };
        let start = Instant::now();
        assert!(locks.try_lock("k", &policy));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
        locks.unlock("k");
    }

    #[test]
    fn test_sweeper_drops_abandoned_records() {
        let locks = Arc::new(service());
        {
            let locks = Arc::clone(&locks);
            let policy = LockPolicy {
                wait: Duration::ZERO,
                lease: Some(Duration::from_millis(50)),
                fair: false,
            };
            // Holder exits without releasing.
            thread::spawn(move || assert!(locks.try_lock("k", &policy)))
                .join()
                .unwrap();
        }
        assert_eq!(locks.len(), 1);

        // Lease expiry with no waiters: the sweeper reclaims the hold and
        // drops the record.
        thread::sleep(Duration::from_millis(300));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_metrics_sink_may_inspect_the_service() {
        // A sink that calls back into the service must not find the per-key
        // mutex still held by the acquisition it is observing.
        #[derive(Debug, Default)]
        struct InspectingSink {
            service: Mutex<Option<Arc<LocalLockService>>>,
            consistent: Mutex<Vec<bool>>,
        }
        impl crate::metrics::MetricsSink for InspectingSink {
            fn record_lock_acquire(&self, acquired: bool, _wait: Duration) {
                if let Some(service) = self.service.lock().clone() {
                    self.consistent.lock().push(service.is_locked("k") == acquired);
                }
            }
        }

        let sink = Arc::new(InspectingSink::default());
        let locks = Arc::new(LocalLockService::new(sink.clone()));
        *sink.service.lock() = Some(Arc::clone(&locks));

        assert!(locks.try_lock("k", &probe()));
        locks.unlock("k");
        assert_eq!(sink.consistent.lock().as_slice(), &[true]);

        // Break the cycle so the service (and its sweeper) can drop.
        *sink.service.lock() = None;
    }

    #[test]
    fn test_unlock_by_non_holder_is_ignored() {
        let locks = Arc::new(service());
        assert!(locks.try_lock("k", &probe()));

        {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.unlock("k")).join().unwrap();
        }

        // Still held by this thread.
        thread::scope(|s| {
            assert!(!s.spawn(|| locks.try_lock("k", &probe())).join().unwrap());
        });
        locks.unlock("k");
    }

    #[test]
    fn test_force_unlock_frees_any_holder() {
        let locks = Arc::new(service());
        {
            let locks = Arc::clone(&locks);
            thread::spawn(move || assert!(locks.try_lock("k", &probe())))
                .join()
                .unwrap();
        }
        assert!(locks.is_locked("k"));

        locks.force_unlock("k");
        assert!(!locks.is_locked("k"));
        assert!(locks.try_lock("k", &probe()));
        locks.unlock("k");
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let locks = Arc::new(service());
        let counter = Arc::new(Mutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let policy = LockPolicy {
                    wait: Duration::from_secs(5),
                    ..LockPolicy::default()
                };
                for _ in 0..50 {
                    assert!(locks.try_lock("counter", &policy));
                    let mut n = counter.lock();
                    *n += 1;
                    drop(n);
                    locks.unlock("counter");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
    }

    #[test]
    fn test_fair_mode_serves_in_arrival_order() {
        let locks = Arc::new(service());
        let fair = LockPolicy {
            wait: Duration::from_secs(5),
            lease: None,
            fair: true,
        };
        assert!(locks.try_lock("k", &fair));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            let fair = fair.clone();
            handles.push(thread::spawn(move || {
                assert!(locks.try_lock("k", &fair));
                order.lock().push(i);
                locks.unlock("k");
            }));
            // Stagger arrival so the queue order is deterministic.
            thread::sleep(Duration::from_millis(50));
        }

        locks.unlock("k");
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
