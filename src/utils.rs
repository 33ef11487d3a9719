//! Small time helpers shared by the limiter, lock, and cache modules.
//!
//! Rate limiting and idle eviction both need a cheap "now in epoch
//! milliseconds" that cannot run backwards when the wall clock is adjusted.
//! We capture the wall-clock epoch once at first use and advance it with a
//! monotonic `Instant` from then on.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// Wall-clock epoch millis paired with the Instant they were observed at.
static TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// Returns the current time in milliseconds since the UNIX epoch.
///
/// Monotonic after process start: NTP adjustments or manual clock changes
/// cannot make successive calls go backwards. Millisecond precision is
/// sufficient for refill accounting and idle-eviction decisions.
///
/// # Example
///
/// ```rust
/// use turnstile::current_time_ms;
///
/// let a = current_time_ms();
/// let b = current_time_ms();
/// assert!(b >= a);
/// ```
#[inline]
pub fn current_time_ms() -> u64 {
    let (base_instant, base_ms) = *TIME_BASE.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        (Instant::now(), wall)
    });
    base_ms.saturating_add(base_instant.elapsed().as_millis() as u64)
}
