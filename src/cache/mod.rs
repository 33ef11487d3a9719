//! Read-through cache that survives expiry storms.
//!
//! Entries live in the shared store as JSON with a jittered TTL, so a set
//! of keys written together does not expire together. A confirmed miss is
//! cached too, as a short-lived tombstone, so absent records cannot be
//! probed into the backing database over and over.
//!
//! The reload path is the point of the module. When an entry is missing,
//! readers race for a per-key reload lock; exactly one runs the loader,
//! writes the result back, and the rest find the fresh entry on their
//! double-check. A reader that cannot take the lock within its wait bound
//! does not fail: it bypasses the cache and loads directly, trading one
//! redundant backend read for availability. Store outages degrade the
//! same way.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::lock::{LockPolicy, LockService};
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Marker value of a confirmed-miss entry. JSON never begins with a NUL
/// byte, so the marker cannot collide with a real value.
const TOMBSTONE: &[u8] = &[0x00, b't', b's'];

enum Decoded<V> {
    Miss,
    Negative,
    Value(V),
}

/// Read-through cache over the shared store, stampede-safe per key. See
/// the [module docs](self).
///
/// Values are serialized as JSON. The `name` namespaces keys in the store
/// and labels cache metrics.
pub struct StampedeSafeCache<V> {
    name: String,
    store: Arc<dyn SharedStore>,
    locks: Arc<dyn LockService>,
    metrics: Arc<dyn MetricsSink>,
    config: CacheConfig,
    _values: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for StampedeSafeCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampedeSafeCache")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<V: Serialize + DeserializeOwned> StampedeSafeCache<V> {
    /// Creates a cache named `name` over the given store and lock service.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`CacheConfig::validate`]; construct from a
    /// validated [`AdmissionConfig`](crate::AdmissionConfig) to avoid this.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn SharedStore>,
        locks: Arc<dyn LockService>,
        metrics: Arc<dyn MetricsSink>,
        config: CacheConfig,
    ) -> Self {
        config.validate().expect("invalid cache configuration");
        Self {
            name: name.into(),
            store,
            locks,
            metrics,
            config,
            _values: PhantomData,
        }
    }

    /// Reads `key`, running `loader` on a miss.
    ///
    /// `Ok(None)` means the record is confirmed absent (by a cached
    /// tombstone or by the loader). The loader's error is the only error a
    /// caller sees: store and lock trouble degrade to a direct load.
    pub fn get<F, E>(&self, key: &str, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        let entry_key = self.entry_key(key);

        match self.read(&entry_key) {
            Ok(Decoded::Value(value)) => {
                self.metrics.record_cache_hit(&self.name);
                return Ok(Some(value));
            }
            Ok(Decoded::Negative) => {
                self.metrics.record_cache_hit(&self.name);
                return Ok(None);
            }
            Ok(Decoded::Miss) => {}
            Err(err) => {
                warn!(cache = %self.name, key, %err, "store unavailable, bypassing cache");
                self.metrics.record_cache_bypass(&self.name);
                return loader();
            }
        }
        self.metrics.record_cache_miss(&self.name);

        let lock_key = format!("cache-load:{entry_key}");
        let policy = LockPolicy {
            wait: Duration::from_millis(self.config.lock_wait_ms),
            lease: Some(Duration::from_millis(self.config.lock_lease_ms)),
            fair: false,
        };
        if !self.locks.try_lock(&lock_key, &policy) {
            // Contended past the wait bound. One redundant backend read
            // beats failing the caller.
            warn!(cache = %self.name, key, "reload lock contended, bypassing cache");
            self.metrics.record_cache_bypass(&self.name);
            return loader();
        }
        let _guard = ReleaseGuard { locks: &*self.locks, key: &lock_key };

        // Double-check: the previous lock holder may have reloaded this
        // exact key while we waited.
        match self.read(&entry_key) {
            Ok(Decoded::Value(value)) => return Ok(Some(value)),
            Ok(Decoded::Negative) => return Ok(None),
            Ok(Decoded::Miss) | Err(_) => {}
        }

        let loaded = loader()?;
        self.write_back(&entry_key, loaded.as_ref());
        Ok(loaded)
    }

    /// Reads several keys in one store round trip, taking the single-key
    /// reload path for each miss.
    pub fn get_many<F, E>(&self, keys: &[String], mut loader: F) -> Result<Vec<Option<V>>, E>
    where
        F: FnMut(&str) -> Result<Option<V>, E>,
    {
        let entry_keys: Vec<String> = keys.iter().map(|k| self.entry_key(k)).collect();
        let raws = match self.store.get_many(&entry_keys) {
            Ok(raws) => raws,
            Err(err) => {
                warn!(cache = %self.name, %err, "store unavailable, bypassing cache for batch");
                for _ in keys {
                    self.metrics.record_cache_bypass(&self.name);
                }
                return keys.iter().map(|k| loader(k)).collect();
            }
        };

        keys.iter()
            .zip(raws)
            .map(|(key, raw)| match self.decode(&self.entry_key(key), raw) {
                Decoded::Value(value) => {
                    self.metrics.record_cache_hit(&self.name);
                    Ok(Some(value))
                }
                Decoded::Negative => {
                    self.metrics.record_cache_hit(&self.name);
                    Ok(None)
                }
                Decoded::Miss => self.get(key, || loader(key)),
            })
            .collect()
    }

    /// Writes `value` through to the cache under a fresh jittered TTL.
    pub fn put(&self, key: &str, value: &V) -> Result<(), crate::StoreError> {
        match serde_json::to_vec(value) {
            Ok(raw) => self.store.set(&self.entry_key(key), &raw, Some(self.value_ttl())),
            Err(err) => {
                warn!(cache = %self.name, key, %err, "value not serializable, skipping cache write");
                Ok(())
            }
        }
    }

    /// Replaces the entry with a tombstone, masking the key as absent for
    /// the tombstone TTL. The write path calls this after a deletion so
    /// lagging database replicas cannot resurrect the record.
    pub fn mark_absent(&self, key: &str) -> Result<(), crate::StoreError> {
        self.store
            .set(&self.entry_key(key), TOMBSTONE, Some(self.config.tombstone_ttl()))
    }

    /// Drops the entry outright; the next read reloads.
    pub fn invalidate(&self, key: &str) -> Result<bool, crate::StoreError> {
        self.store.delete(&self.entry_key(key))
    }

    /// Drops a batch of entries; the write path's bulk-delete hook.
    /// Returns how many were present.
    pub fn invalidate_many(&self, keys: &[String]) -> Result<usize, crate::StoreError> {
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&self.entry_key(key))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn entry_key(&self, key: &str) -> String {
        format!("cache:{}:{key}", self.name)
    }

    /// Positive-entry TTL with fresh random jitter, so co-written entries
    /// expire apart.
    fn value_ttl(&self) -> Duration {
        let jitter = self.config.jitter().mul_f64(rand::rng().random_range(0.0..=1.0));
        self.config.base_ttl() + jitter
    }

    fn read(&self, entry_key: &str) -> Result<Decoded<V>, crate::StoreError> {
        let raw = self.store.get(entry_key)?;
        Ok(self.decode(entry_key, raw))
    }

    fn decode(&self, entry_key: &str, raw: Option<Vec<u8>>) -> Decoded<V> {
        match raw {
            None => Decoded::Miss,
            Some(raw) if raw == TOMBSTONE => Decoded::Negative,
            Some(raw) => match serde_json::from_slice(&raw) {
                Ok(value) => Decoded::Value(value),
                Err(err) => {
                    // Treat as a miss and clear it so it cannot poison
                    // later reads.
                    warn!(key = entry_key, %err, "corrupt cache entry dropped");
                    let _ = self.store.delete(entry_key);
                    Decoded::Miss
                }
            },
        }
    }

    fn write_back(&self, entry_key: &str, value: Option<&V>) {
        let result = match value {
            Some(value) => match serde_json::to_vec(value) {
                Ok(raw) => self.store.set(entry_key, &raw, Some(self.value_ttl())),
                Err(err) => {
                    warn!(key = entry_key, %err, "loaded value not serializable, not cached");
                    return;
                }
            },
            None => self.store.set(entry_key, TOMBSTONE, Some(self.config.tombstone_ttl())),
        };
        match result {
            Ok(()) => debug!(key = entry_key, cached = value.is_some(), "cache entry written"),
            // The caller still gets its value; only future reads pay.
            Err(err) => warn!(key = entry_key, %err, "cache write-back failed"),
        }
    }
}

struct ReleaseGuard<'a> {
    locks: &'a dyn LockService,
    key: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.locks.unlock(self.key);
    }
}
