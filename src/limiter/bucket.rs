//! Continuous-refill token bucket with optional warm-up.
//!
//! This is the single-key primitive underneath all three limiter tiers.
//! Permits accrue continuously at `rate` per second, capped at a burst
//! capacity of one second of permits, and are debited per admitted call.
//! All accounting is floating point against wall-clock deltas; refill and
//! debit happen together under one short critical section per bucket, so
//! concurrent acquirers can neither lose an update nor over-admit.
//!
//! ## Warm-up
//!
//! A bucket created with a warm-up ramp starts empty and accrues permits
//! at a rate that climbs linearly from a fraction of the target to the
//! full target over the ramp window:
//!
//! ```text
//!     rate
//!       │              ┌────────────  target
//!       │            ／
//!       │          ／
//!       │        ／
//!       │──────┘                      target / 3 (cold)
//!       └──────┬───────┬──────────── time
//!            created  warm-up end
//! ```
//!
//! A cold limiter therefore cannot admit full throughput the moment the
//! process (re)starts, which protects downstream systems that also need to
//! warm caches and pools.
//!
//! ## Blocking
//!
//! [`TokenBucket::acquire`] takes an [`AcquireTimeout`]: a non-blocking
//! probe, a bounded wait, or an unbounded wait. Waiting is implemented as
//! sleep-until-estimated-eligibility: the holder of the critical section
//! computes when the deficit will have accrued at the current effective
//! rate, sleeps outside the lock, and re-checks on wake. The estimate is
//! exact for a constant-rate bucket and conservative during a warm-up
//! ramp (the true rate only climbs), so a wake never finds fewer permits
//! than estimated. A bounded wait caps the sleep at its deadline and
//! denies up front only when even the target rate could not cover the
//! deficit in time.
//!
//! Absence of permits is never an error: every path reports it as `false`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::utils::current_time_ms;

/// Ratio between the target rate and the starting rate of a warm-up ramp.
const COLD_RATE_FACTOR: f64 = 3.0;

/// Shortest sleep while waiting for permits, to bound wake-up churn when
/// the deficit is tiny.
const MIN_WAIT_SLEEP: Duration = Duration::from_millis(1);

/// Minimum interval between `last_access` timestamp updates (milliseconds).
/// Access tracking feeds idle eviction only, so 100 ms granularity is
/// plenty and keeps the hot path off the shared timestamp.
const LAST_ACCESS_UPDATE_INTERVAL_MS: u64 = 100;

/// How long an acquisition may wait for permits.
///
/// The wire-level convention used by callers is a signed millisecond
/// value; [`AcquireTimeout::from_millis`] maps it onto this enum:
/// negative blocks until granted, zero probes without blocking, positive
/// waits up to the given duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireTimeout {
    /// Probe once; return immediately either way.
    NonBlocking,
    /// Wait up to this long for the permits to accrue.
    Wait(Duration),
    /// Wait until granted, bounded only by process lifetime.
    Forever,
}

impl AcquireTimeout {
    /// Maps the signed-millisecond convention onto the enum:
    /// `< 0` ⇒ [`Forever`](Self::Forever), `0` ⇒
    /// [`NonBlocking`](Self::NonBlocking), `> 0` ⇒ [`Wait`](Self::Wait).
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ..=-1 => Self::Forever,
            0 => Self::NonBlocking,
            _ => Self::Wait(Duration::from_millis(ms as u64)),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    permits: f64,
    last_refill: Instant,
}

/// Single-key rate-limit primitive with continuous refill and optional
/// warm-up. See the [module docs](self) for semantics.
///
/// Cheap to share: all methods take `&self` and the type is `Send + Sync`.
///
/// # Example
///
/// ```rust
/// use turnstile::TokenBucket;
///
/// // 10 permits per second, burst of 10.
/// let bucket = TokenBucket::new(10.0, None);
///
/// assert!(bucket.try_acquire());
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    capacity: f64,
    warmup: Option<Duration>,
    started: Instant,

    /// Epoch millis of the last acquisition attempt; read by the registry
    /// for idle eviction.
    last_access_ms: AtomicU64,

    total_acquired: AtomicU64,
    total_rejected: AtomicU64,
}

impl TokenBucket {
    /// Creates a bucket admitting `rate` permits per second, with burst
    /// capacity equal to one second of permits.
    ///
    /// With a warm-up ramp the bucket starts empty and its effective rate
    /// climbs from `rate / 3` to `rate` over `warmup`; without one it
    /// starts full.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not a positive finite number. A non-positive
    /// rate is a fatal misconfiguration, not a runtime condition.
    pub fn new(rate: f64, warmup: Option<Duration>) -> Self {
        assert!(
            rate.is_finite() && rate > 0.0,
            "rate limiter rate must be positive, got {rate}"
        );
        let capacity = rate.max(1.0);
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                permits: if warmup.is_some() { 0.0 } else { capacity },
                last_refill: now,
            }),
            rate,
            capacity,
            warmup: warmup.filter(|w| !w.is_zero()),
            started: now,
            last_access_ms: AtomicU64::new(current_time_ms()),
            total_acquired: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Attempts to take one permit without blocking.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.acquire(1, AcquireTimeout::NonBlocking)
    }

    /// Attempts to take `permits` permits without blocking. All or
    /// nothing: on `false` no permits are debited.
    #[inline]
    pub fn try_acquire_n(&self, permits: u32) -> bool {
        self.acquire(permits, AcquireTimeout::NonBlocking)
    }

    /// Attempts to take `permits` permits under the given timeout policy.
    ///
    /// Returns `true` once the permits were debited, `false` if they could
    /// not be within the timeout. Requests larger than the burst capacity
    /// can never succeed and fail immediately regardless of policy.
    pub fn acquire(&self, permits: u32, timeout: AcquireTimeout) -> bool {
        if permits == 0 {
            return true;
        }
        let need = f64::from(permits);
        if need > self.capacity {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let deadline = match timeout {
            AcquireTimeout::Wait(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            let now = Instant::now();
            self.touch();

            let deficit = {
                let mut state = self.state.lock();
                self.refill_locked(&mut state, now);
                if state.permits >= need {
                    state.permits -= need;
                    drop(state);
                    self.total_acquired.fetch_add(u64::from(permits), Ordering::Relaxed);
                    return true;
                }
                need - state.permits
            };
            let eta =
                Duration::from_secs_f64(deficit / self.effective_rate(now)).max(MIN_WAIT_SLEEP);

            match timeout {
                AcquireTimeout::NonBlocking => {
                    self.total_rejected.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                AcquireTimeout::Wait(_) => {
                    let deadline = deadline.expect("deadline set for Wait");
                    // The target rate bounds accrual from above, so only a
                    // deficit that cannot accrue even at full rate is a
                    // denial now. On a ramp the current-rate eta may
                    // overshoot a deadline the climbing rate still meets,
                    // so otherwise sleep (capped at the deadline) and
                    // re-check.
                    let floor =
                        Duration::from_secs_f64(deficit / self.rate).max(MIN_WAIT_SLEEP);
                    if now + floor > deadline {
                        self.total_rejected.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    let sleep = eta.min(deadline.duration_since(now));
                    trace!(eta_ms = sleep.as_millis() as u64, "waiting for permits");
                    std::thread::sleep(sleep);
                }
                AcquireTimeout::Forever => {
                    trace!(eta_ms = eta.as_millis() as u64, "waiting for permits");
                    std::thread::sleep(eta);
                }
            }
        }
    }

    /// The permits currently available, after applying any pending refill.
    pub fn available_permits(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill_locked(&mut state, now);
        state.permits
    }

    /// The sustained rate in permits per second.
    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Total permits debited over the bucket's lifetime.
    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    /// Total denied acquisition attempts over the bucket's lifetime.
    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    /// Whether the bucket has gone unused for at least `idle_ms`.
    pub fn is_inactive(&self, idle_ms: u64) -> bool {
        self.idle_millis() >= idle_ms
    }

    /// Milliseconds since the last acquisition attempt, at the coarse
    /// granularity of the access timestamp.
    pub fn idle_millis(&self) -> u64 {
        let last = self.last_access_ms.load(Ordering::Relaxed);
        current_time_ms().saturating_sub(last)
    }

    fn touch(&self) {
        let now_ms = current_time_ms();
        let last = self.last_access_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) > LAST_ACCESS_UPDATE_INTERVAL_MS {
            self.last_access_ms.store(now_ms, Ordering::Relaxed);
        }
    }

    fn refill_locked(&self, state: &mut BucketState, now: Instant) {
        if now <= state.last_refill {
            return;
        }
        let accrued = self.accrued_between(state.last_refill, now);
        state.permits = (state.permits + accrued).min(self.capacity);
        state.last_refill = now;
    }

    /// Effective rate at `at`: the target rate, or a point on the linear
    /// warm-up ramp.
    fn effective_rate(&self, at: Instant) -> f64 {
        let Some(warmup) = self.warmup else {
            return self.rate;
        };
        let elapsed = at.saturating_duration_since(self.started).as_secs_f64();
        let window = warmup.as_secs_f64();
        if elapsed >= window {
            return self.rate;
        }
        let cold = self.rate / COLD_RATE_FACTOR;
        cold + (self.rate - cold) * (elapsed / window)
    }

    /// Permits accrued over `[from, to]`: the integral of the effective
    /// rate, split at the ramp boundary where the slope changes.
    fn accrued_between(&self, from: Instant, to: Instant) -> f64 {
        let Some(warmup) = self.warmup else {
            return self.rate * to.duration_since(from).as_secs_f64();
        };
        let ramp_end = self.started + warmup;
        if from >= ramp_end {
            return self.rate * to.duration_since(from).as_secs_f64();
        }
        let ramp_to = to.min(ramp_end);
        // The ramp is linear, so the trapezoid rule is exact on it.
        let ramp_secs = ramp_to.duration_since(from).as_secs_f64();
        let on_ramp =
            (self.effective_rate(from) + self.effective_rate(ramp_to)) / 2.0 * ramp_secs;
        let after_ramp = if to > ramp_end {
            self.rate * to.duration_since(ramp_end).as_secs_f64()
        } else {
            0.0
        };
        on_ramp + after_ramp
    }
}
