//! Cross-process token bucket backed by the shared store.
//!
//! The local [`TokenBucket`](crate::TokenBucket) tiers bound a single
//! process; this bucket bounds the fleet. Its state lives in the shared
//! store under one key per limit, and every acquisition is a single
//! execution of the store's atomic token-bucket script, so concurrent
//! processes cannot over-admit or lose refill.
//!
//! Two deliberate asymmetries with the local bucket:
//!
//! - **Fail open.** A store failure grants the permit. The local tiers
//!   remain the primary control; refusing traffic because the coordination
//!   store is down would convert a partial outage into a full one.
//! - **Polling, not sleeping-to-eta.** There is no cross-process wake-up,
//!   so a blocking acquisition re-runs the script on a coarse cadence.
//!   Waiters are served best-effort, not in arrival order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::DistributedConfig;
use crate::limiter::AcquireTimeout;
use crate::store::{PermitScriptArgs, SharedStore};
use crate::utils::current_time_ms;

/// Namespace prefix of bucket state keys in the shared store.
const KEY_PREFIX: &str = "rate_limiter:";

/// Floor of the polling cadence while blocked.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fleet-wide token bucket. One instance serves any number of limit keys;
/// all state lives in the shared store.
#[derive(Debug)]
pub struct DistributedTokenBucket {
    store: Arc<dyn SharedStore>,
    enabled: bool,
    burst_factor: f64,
    bucket_ttl: Duration,
}

impl DistributedTokenBucket {
    /// Creates a bucket over `store` with the given settings. When the
    /// config disables distributed limiting, every acquisition trivially
    /// grants.
    pub fn new(store: Arc<dyn SharedStore>, config: &DistributedConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            burst_factor: config.burst_factor,
            bucket_ttl: Duration::from_secs(config.bucket_ttl_secs),
        }
    }

    /// Whether acquisitions consult the shared store at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attempts to debit `permits` from the fleet-wide bucket for `key`,
    /// refilling at `rate` permits per second with capacity
    /// `rate * burst_factor`.
    ///
    /// Returns `true` when granted, `false` when the timeout elapsed while
    /// denied. Store failures grant (fail open) after a warning.
    pub fn try_acquire(
        &self,
        key: &str,
        rate: f64,
        permits: u32,
        timeout: AcquireTimeout,
    ) -> bool {
        if !self.enabled || permits == 0 {
            return true;
        }
        let full_key = format!("{KEY_PREFIX}{key}");
        let needed = f64::from(permits);
        let capacity = rate * self.burst_factor;
        if needed > capacity {
            return false;
        }

        // Roughly the time for the deficit to refill, floored so a busy
        // fleet is not hammered with script calls.
        let poll = Duration::from_secs_f64(needed / rate).max(MIN_POLL_INTERVAL);
        let deadline = match timeout {
            AcquireTimeout::Wait(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            let args = PermitScriptArgs {
                capacity,
                rate,
                permits: needed,
                now_ms: current_time_ms(),
                entry_ttl: self.bucket_ttl,
            };
            match self.store.acquire_permits(&full_key, &args) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    warn!(key, %err, "shared store unavailable, granting permit locally");
                    return true;
                }
            }

            match timeout {
                AcquireTimeout::NonBlocking => return false,
                AcquireTimeout::Wait(_) => {
                    let deadline = deadline.expect("deadline set for Wait");
                    if Instant::now() + poll > deadline {
                        return false;
                    }
                    std::thread::sleep(poll);
                }
                AcquireTimeout::Forever => std::thread::sleep(poll),
            }
        }
    }
}
