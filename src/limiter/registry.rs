//! Keyed registry of token buckets with lazy creation and idle eviction.
//!
//! The registry is the shared map behind the per-interface and per-user
//! tiers: callers ask for the limiter of a key and always get one, created
//! on first use. Creation is race-safe without a global lock: each key
//! owns a publication slot, concurrent first-callers each build a
//! candidate, exactly one publishes it with a compare-and-swap, and the
//! losers adopt the winner's limiter. Every published limiter carries a
//! monotonically increasing version, so a slot re-created after eviction
//! is distinguishable from the one it replaced.
//!
//! Memory is bounded two ways, mirroring how the buckets themselves decay:
//! a periodic sweep evicts limiters idle past the configured threshold,
//! and a capacity ceiling triggers an emergency least-recently-used sweep
//! so that lookups never have to fail for lack of room.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::limiter::TokenBucket;
use crate::metrics::MetricsSink;

/// Fraction of capacity (percent) at which lookups trigger an emergency
/// sweep before inserting.
const SWEEP_THRESHOLD_PCT: usize = 90;

/// Fraction of capacity (percent) an emergency sweep reduces the registry
/// to, leaving headroom before the next sweep.
const SWEEP_TARGET_PCT: usize = 70;

/// A published limiter together with its registry generation.
///
/// Versions are unique across the registry's lifetime: a key evicted and
/// later re-created yields a handle with a different version, which lets a
/// holder detect that its limiter was replaced.
#[derive(Debug)]
pub struct VersionedLimiter {
    version: u64,
    bucket: Arc<TokenBucket>,
}

impl VersionedLimiter {
    /// The registry generation this limiter was published under.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The limiter itself.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }
}

/// A key's publication slot. The creation timestamp lets the sweeps tell
/// a creation in flight (slot inserted, limiter not yet published) from a
/// slot abandoned mid-creation.
#[derive(Debug)]
struct Slot {
    limiter: ArcSwapOption<VersionedLimiter>,
    created: Instant,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            limiter: ArcSwapOption::empty(),
            created: Instant::now(),
        }
    }
}

type SlotRef = Arc<Slot>;

/// Shared map of keyed [`TokenBucket`]s with lazy creation, idle eviction,
/// and a hard capacity bound. See the [module docs](self).
///
/// Keys follow the `TYPE:target` convention (`INTERFACE:UserService.login`,
/// `USER:42`); the prefix is echoed to the metrics sink on eviction.
#[derive(Debug)]
pub struct LimiterRegistry {
    slots: DashMap<String, SlotRef, ahash::RandomState>,
    config: RegistryConfig,
    metrics: Arc<dyn MetricsSink>,
    next_version: AtomicU64,
    sweep_in_progress: AtomicBool,
    total_evicted: AtomicU64,
}

/// Resets the sweep flag when a sweep exits on any path.
struct SweepGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl LimiterRegistry {
    /// Creates an empty registry. `metrics` receives an observation per
    /// eviction.
    pub fn new(config: RegistryConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            slots: DashMap::with_hasher(ahash::RandomState::new()),
            config,
            metrics,
            next_version: AtomicU64::new(1),
            sweep_in_progress: AtomicBool::new(false),
            total_evicted: AtomicU64::new(0),
        }
    }

    /// Returns the limiter registered under `key`, creating it with the
    /// given rate and warm-up if absent.
    ///
    /// This never fails: at capacity, the least-recently-used entries are
    /// swept to make room. Under a creation race every caller receives the
    /// same limiter; losing candidates are dropped unused.
    pub fn get_or_create(
        &self,
        key: &str,
        qps: f64,
        warmup: Option<Duration>,
    ) -> Arc<TokenBucket> {
        self.handle_for(key, qps, warmup).bucket.clone()
    }

    /// Like [`get_or_create`](Self::get_or_create), but returns the
    /// versioned handle for callers that track replacement.
    pub fn handle_for(
        &self,
        key: &str,
        qps: f64,
        warmup: Option<Duration>,
    ) -> Arc<VersionedLimiter> {
        // Fast path: slot exists and is populated.
        if let Some(slot) = self.slots.get(key) {
            let slot = slot.value().clone();
            if let Some(existing) = slot.limiter.load_full() {
                return existing;
            }
            return self.publish(&slot, qps, warmup);
        }

        self.ensure_room();

        let slot = self
            .slots
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        if let Some(existing) = slot.limiter.load_full() {
            return existing;
        }
        self.publish(&slot, qps, warmup)
    }

    /// Returns the versioned handle for `key` without creating one.
    pub fn get(&self, key: &str) -> Option<Arc<VersionedLimiter>> {
        self.slots
            .get(key)
            .and_then(|slot| slot.value().limiter.load_full())
    }

    /// Drops the limiter registered under `key`, if any. A later lookup
    /// re-creates it cold.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.slots.remove(key).is_some();
        if removed {
            self.total_evicted.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry holds no limiters.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total limiters evicted over the registry's lifetime.
    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }

    /// Total limiter versions allocated over the registry's lifetime. A
    /// lost creation race allocates a version for a candidate that is
    /// immediately discarded, so this can exceed the published count.
    pub fn total_created(&self) -> u64 {
        self.next_version.load(Ordering::Relaxed) - 1
    }

    /// Builds a candidate outside any map lock and publishes it into the
    /// slot. Exactly one concurrent caller wins the compare-and-swap; the
    /// rest adopt the winner.
    fn publish(
        &self,
        slot: &Slot,
        qps: f64,
        warmup: Option<Duration>,
    ) -> Arc<VersionedLimiter> {
        let candidate = Arc::new(VersionedLimiter {
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
            bucket: Arc::new(TokenBucket::new(qps, warmup)),
        });
        let prev = slot.limiter.compare_and_swap(
            &None::<Arc<VersionedLimiter>>,
            Some(Arc::clone(&candidate)),
        );
        match prev.as_ref() {
            None => candidate,
            Some(winner) => {
                debug!(version = winner.version, "lost limiter creation race, adopting winner");
                Arc::clone(winner)
            }
        }
    }

    /// Evicts limiters idle past the configured threshold. Safe to call
    /// from any thread; normally driven by the background cleanup thread.
    pub fn cleanup(&self) {
        let len = self.slots.len();
        if len == 0 {
            return;
        }
        // Sweep twice as eagerly when nearing capacity.
        let idle_ms = if len >= self.sweep_threshold() {
            self.config.idle_secs * 1000 / 2
        } else {
            self.config.idle_secs * 1000
        };

        let grace = self.creation_grace();
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0u64;
        for key in keys {
            let evicted = self
                .slots
                .remove_if(&key, |_, slot| match slot.limiter.load_full() {
                    Some(limiter) => limiter.bucket.is_inactive(idle_ms),
                    // An empty slot younger than the grace period is a
                    // creation in flight; older ones were abandoned.
                    None => slot.created.elapsed() >= grace,
                });
            if let Some((key, slot)) = evicted {
                removed += 1;
                self.observe_eviction(&key, &slot);
            }
        }

        if removed > 0 {
            self.total_evicted.fetch_add(removed, Ordering::Relaxed);
            debug!(removed, remaining = self.slots.len(), "evicted idle limiters");
        }
    }

    fn sweep_threshold(&self) -> usize {
        self.config.max_entries * SWEEP_THRESHOLD_PCT / 100
    }

    /// How long an unpublished slot is off-limits to the sweeps. One sweep
    /// interval is orders of magnitude longer than any publication takes.
    fn creation_grace(&self) -> Duration {
        Duration::from_secs(self.config.cleanup_interval_secs.max(1))
    }

    /// Guarantees an insertion cannot push the registry past its bound:
    /// above the high-water mark, sweep the least-recently-used entries
    /// down to the target size, idle or not.
    fn ensure_room(&self) {
        if self.slots.len() < self.sweep_threshold().max(1) {
            return;
        }
        if self
            .sweep_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread is already sweeping.
            return;
        }
        let _guard = SweepGuard {
            flag: &self.sweep_in_progress,
        };

        let target = self.config.max_entries * SWEEP_TARGET_PCT / 100;
        let before = self.slots.len();
        if before <= target {
            return;
        }
        let to_remove = before - target;

        info!(before, target, "limiter registry near capacity, sweeping least recently used");

        // Coldest first. Abandoned empty slots go first; ones inside the
        // creation grace period count as hot.
        let grace = self.creation_grace();
        let mut candidates: Vec<(u64, String)> = self
            .slots
            .iter()
            .map(|entry| {
                let idle = match entry.value().limiter.load_full() {
                    Some(limiter) => limiter.bucket.idle_millis(),
                    None if entry.value().created.elapsed() < grace => 0,
                    None => u64::MAX,
                };
                (idle, entry.key().clone())
            })
            .collect();
        candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0u64;
        for (_, key) in candidates.into_iter().take(to_remove) {
            if let Some((key, slot)) = self.slots.remove(&key) {
                removed += 1;
                self.observe_eviction(&key, &slot);
            }
        }

        self.total_evicted.fetch_add(removed, Ordering::Relaxed);
        let after = self.slots.len();
        if after > target {
            warn!(after, target, "capacity sweep fell short of target");
        } else {
            info!(removed, after, "capacity sweep complete");
        }
    }

    fn observe_eviction(&self, key: &str, slot: &Slot) {
        let (scope, target) = key.split_once(':').unwrap_or(("UNKNOWN", key));
        let rate = slot.limiter.load_full().map_or(0.0, |l| l.bucket.rate());
        self.metrics.record_eviction(scope, target, rate);
    }

    /// Starts a background thread sweeping idle limiters every
    /// `cleanup_interval_secs`. Returns the join handle and a sender;
    /// sending `()` (or dropping the sender) stops the thread.
    pub fn start_cleanup_thread(
        self: Arc<Self>,
    ) -> (thread::JoinHandle<()>, mpsc::Sender<()>) {
        let (stop_tx, stop_rx) = mpsc::channel();
        let registry = Arc::clone(&self);
        let interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        let handle = thread::Builder::new()
            .name("turnstile-cleanup".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "limiter cleanup thread started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            info!("limiter cleanup thread stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            registry.cleanup();
                        }
                    }
                }
            })
            .expect("failed to spawn limiter cleanup thread");

        (handle, stop_tx)
    }
}
