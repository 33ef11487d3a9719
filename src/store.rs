//! The narrow interface to the shared key-value store.
//!
//! Distributed rate limiting, distributed locking, and the cache all talk
//! to the same external store (a Redis-like system in production) through
//! [`SharedStore`]: plain get/set/delete with TTLs, two conditional
//! operations, and one atomic server-side token-bucket script. Nothing in
//! this crate implements a storage engine; [`InMemoryStore`] is a faithful
//! in-process stand-in for tests and single-node deployments.
//!
//! The conditional operations are the primitives the lock service is built
//! from:
//!
//! - `set_if_absent` with a TTL is "acquire a lease";
//! - `delete_if_equals` is "release only if I still own it", the classic
//!   owner-checked unlock executed server-side in one round trip.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Failure talking to the shared store.
///
/// How a caller reacts is policy, not mechanics: distributed *locking*
/// fails closed (treat as not acquired), distributed *rate limiting* fails
/// open (treat as granted, local limiting remains the primary control), and
/// the cache degrades to direct loads.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered with a transport error.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// The store answered, but the entry could not be interpreted.
    #[error("corrupt entry for key '{key}'")]
    Corrupt {
        /// The key whose entry failed to decode.
        key: String,
    },
}

/// Inputs of the atomic token-bucket script.
///
/// The script reads the bucket's `(last_refill_ms, permits)` state, applies
/// elapsed-time refill capped at `capacity`, and either debits `permits`
/// and writes the state back with `entry_ttl`, or denies and leaves the
/// state untouched. One round trip, side-effect-free on denial.
#[derive(Debug, Clone, Copy)]
pub struct PermitScriptArgs {
    /// Maximum permits the bucket can hold.
    pub capacity: f64,
    /// Refill rate, permits per second.
    pub rate: f64,
    /// Permits to debit.
    pub permits: f64,
    /// Caller's clock, milliseconds since the UNIX epoch. Passed in so the
    /// script never reads a clock of its own.
    pub now_ms: u64,
    /// Expiry of the bucket state; idle buckets self-clean.
    pub entry_ttl: Duration,
}

/// A shared key-value store with TTLs, conditional writes, and one atomic
/// script, as consumed by the distributed limiter, the distributed lock
/// service, and the cache.
///
/// Implementations must be safe for arbitrary concurrent use and must make
/// `set_if_absent` / `delete_if_equals` / `acquire_permits` atomic with
/// respect to each other and to plain writes.
pub trait SharedStore: Send + Sync + fmt::Debug {
    /// Reads the value at `key`, `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reads several keys in one logical round trip.
    ///
    /// The default implementation loops over [`get`](Self::get); real
    /// backends should pipeline.
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Writes `value` at `key`, with an optional expiry.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes `key`. Returns whether an entry was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Writes `value` at `key` only if no live entry exists. Returns whether
    /// the write happened.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<bool, StoreError>;

    /// Deletes `key` only if its current value equals `expected`. Returns
    /// whether the delete happened.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Runs the atomic token-bucket script against `key`.
    ///
    /// Returns `true` when the debit succeeded (state updated), `false`
    /// when denied (state unchanged).
    fn acquire_permits(&self, key: &str, args: &PermitScriptArgs) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`SharedStore`] implementation.
///
/// One mutex over a hash map with lazy TTL expiry. Intended for tests and
/// single-instance deployments where cross-process consistency is not a
/// concern; it honors the full contract, including script atomicity and
/// side-effect-free denial.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries. Test/introspection helper.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<Vec<u8>> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

impl SharedStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let was_live = Self::live_value(&mut entries, key, Instant::now()).is_some();
        entries.remove(key);
        Ok(was_live)
    }

    fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry { value: value.to_vec(), expires_at: ttl.map(|d| now + d) },
        );
        Ok(true)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_value(&mut entries, key, now) {
            Some(value) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn acquire_permits(&self, key: &str, args: &PermitScriptArgs) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Decode prior state; a fresh or unparseable bucket starts full.
        let (last_ms, permits) = Self::live_value(&mut entries, key, now)
            .and_then(|raw| {
                let text = String::from_utf8(raw).ok()?;
                let (ms, p) = text.split_once(' ')?;
                Some((ms.parse::<u64>().ok()?, p.parse::<f64>().ok()?))
            })
            .unwrap_or((args.now_ms, args.capacity));

        let elapsed_secs = args.now_ms.saturating_sub(last_ms) as f64 / 1000.0;
        let refilled = (permits + elapsed_secs * args.rate).min(args.capacity);

        if refilled < args.permits {
            // Denied: leave the stored state untouched.
            return Ok(false);
        }

        let remaining = refilled - args.permits;
        entries.insert(
            key.to_string(),
            Entry {
                value: format!("{} {remaining}", args.now_ms).into_bytes(),
                expires_at: Some(now + args.entry_ttl),
            },
        );
        Ok(true)
    }
}
