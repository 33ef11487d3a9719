//! Configuration for the admission layer.
//!
//! All tunables live in one [`AdmissionConfig`] tree, deserializable from
//! TOML, with defaults matching a conservative single-node deployment:
//! distributed coordination off, local locks, 10 QPS global / 5 QPS
//! per-user limiting. Construct it once at process start, validate it, and
//! hand it to the components that need it; there is no ambient global
//! configuration.
//!
//! Validation is eager and fatal: a non-positive rate or a tombstone TTL
//! that is not strictly shorter than the positive TTL is a deployment
//! mistake, not something to paper over at runtime.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Which [`LockService`](crate::LockService) implementation a deployment
/// uses. Selected once at startup; the two are never composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// In-process locks with a timer-based lease safety net. The default,
    /// correct for single-instance deployments.
    #[default]
    Local,
    /// Leases held in the shared key-value store, enforcing the
    /// single-holder invariant across processes.
    Distributed,
}

/// Top-level configuration for the admission-control layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Sustained rate of the global limiter, permits per second.
    pub global_qps: f64,
    /// Warm-up ramp for the global limiter, seconds. `0` disables warm-up.
    pub global_warmup_secs: u64,
    /// Default acquisition timeout in milliseconds, using the three-way
    /// convention: `< 0` blocks until granted, `0` is a non-blocking probe,
    /// `> 0` waits up to that long.
    pub global_timeout_ms: i64,
    /// Sustained per-user rate, permits per second. Every user gets the
    /// same limit.
    pub user_qps: f64,
    /// Which lock implementation to use.
    pub lock_mode: LockMode,
    /// Limiter-registry sizing and eviction.
    pub registry: RegistryConfig,
    /// Cross-process (distributed) rate limiting.
    pub distributed: DistributedConfig,
    /// Stampede-safe cache behavior.
    pub cache: CacheConfig,
}

/// Sizing and eviction settings for the limiter registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Seconds a limiter may sit unused before it is evicted.
    pub idle_secs: u64,
    /// Maximum number of live limiter entries.
    pub max_entries: usize,
    /// Interval between background cleanup passes, seconds.
    pub cleanup_interval_secs: u64,
}

/// Settings for the best-effort distributed token bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedConfig {
    /// Whether cross-process rate limiting is consulted at all. When off,
    /// the distributed bucket trivially grants.
    pub enabled: bool,
    /// Bucket capacity as a multiple of the sustained rate, for burst
    /// absorption. Capacity = `qps * burst_factor`.
    pub burst_factor: f64,
    /// TTL of the bucket state in the shared store, seconds. Slightly
    /// longer than the time to fully refill, so idle buckets self-clean.
    pub bucket_ttl_secs: u64,
}

/// Settings for [`StampedeSafeCache`](crate::StampedeSafeCache) instances.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Base TTL of a positive entry, seconds. The effective TTL is this
    /// plus a random jitter.
    pub base_ttl_secs: u64,
    /// Upper bound of the random TTL jitter, seconds.
    pub jitter_secs: u64,
    /// TTL of a tombstone (confirmed-miss) entry, seconds. Must be strictly
    /// shorter than `base_ttl_secs`.
    pub tombstone_ttl_secs: u64,
    /// How long a missing reader waits for the reload lock, milliseconds.
    pub lock_wait_ms: u64,
    /// Lease time of the reload lock, milliseconds. The safety net if a
    /// loader crashes while holding it.
    pub lock_lease_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_qps: 10.0,
            global_warmup_secs: 0,
            global_timeout_ms: 0,
            user_qps: 5.0,
            lock_mode: LockMode::Local,
            registry: RegistryConfig::default(),
            distributed: DistributedConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30 * 60,
            max_entries: 10_000,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            burst_factor: 2.0,
            bucket_ttl_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_ttl_secs: 600,
            jitter_secs: 300,
            tombstone_ttl_secs: 60,
            lock_wait_ms: 2000,
            lock_lease_ms: 5000,
        }
    }
}

impl AdmissionConfig {
    /// Parses a configuration from a TOML document and validates it.
    ///
    /// # Example
    ///
    /// ```rust
    /// use turnstile::AdmissionConfig;
    ///
    /// let config = AdmissionConfig::from_toml_str(r#"
    ///     global_qps = 50.0
    ///     user_qps = 10.0
    ///
    ///     [distributed]
    ///     enabled = false
    /// "#).unwrap();
    /// assert_eq!(config.global_qps, 50.0);
    /// ```
    pub fn from_toml_str(doc: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field for consistency.
    ///
    /// Called automatically by [`from_toml_str`](Self::from_toml_str);
    /// call it yourself when building a config programmatically.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_qps <= 0.0 {
            return Err(ConfigError::Invalid("global_qps must be positive"));
        }
        if self.user_qps <= 0.0 {
            return Err(ConfigError::Invalid("user_qps must be positive"));
        }
        if self.registry.max_entries == 0 {
            return Err(ConfigError::Invalid("registry.max_entries must be positive"));
        }
        if self.registry.idle_secs == 0 {
            return Err(ConfigError::Invalid("registry.idle_secs must be positive"));
        }
        if self.distributed.burst_factor < 1.0 {
            return Err(ConfigError::Invalid("distributed.burst_factor must be >= 1"));
        }
        if self.distributed.bucket_ttl_secs == 0 {
            return Err(ConfigError::Invalid("distributed.bucket_ttl_secs must be positive"));
        }
        self.cache.validate()
    }

    /// Warm-up ramp of the global limiter, `None` when disabled.
    pub fn global_warmup(&self) -> Option<Duration> {
        (self.global_warmup_secs > 0).then(|| Duration::from_secs(self.global_warmup_secs))
    }
}

impl CacheConfig {
    /// Checks cache TTL and lock bounds for consistency.
    ///
    /// The tombstone TTL must be *strictly* shorter than the positive TTL:
    /// a confirmed miss may briefly mask a later write, but never for as
    /// long as a real entry lives.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache.base_ttl_secs must be positive"));
        }
        if self.tombstone_ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache.tombstone_ttl_secs must be positive"));
        }
        if self.tombstone_ttl_secs >= self.base_ttl_secs {
            return Err(ConfigError::Invalid(
                "cache.tombstone_ttl_secs must be strictly less than cache.base_ttl_secs",
            ));
        }
        if self.lock_lease_ms == 0 {
            return Err(ConfigError::Invalid("cache.lock_lease_ms must be positive"));
        }
        Ok(())
    }

    /// Base TTL of a positive entry.
    pub fn base_ttl(&self) -> Duration {
        Duration::from_secs(self.base_ttl_secs)
    }

    /// Upper bound of the TTL jitter.
    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }

    /// TTL of a tombstone entry.
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }
}
