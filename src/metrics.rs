//! Metrics reporting for the admission layer.
//!
//! The core never talks to a metrics backend directly; every component
//! reports through [`MetricsSink`], keyed by limiter type + target (or
//! cache name). The sink is an external collaborator: this module carries
//! only a no-op implementation and a Prometheus adapter.
//!
//! Instrument registration is idempotent by construction: the Prometheus
//! adapter uses labelled metric families, so the first observation for a
//! given `(type, target)` pair creates the child instrument and later
//! observations reuse it.

use std::time::Duration;

use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

/// Receiver of admission-layer observations.
///
/// All methods default to no-ops so a sink may implement only what it
/// records. Implementations must be cheap and must never fail: metrics are
/// advisory and sit on the request hot path.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Time a call spent waiting for a permit, granted or not.
    fn record_wait_time(&self, scope: &str, target: &str, wait: Duration) {
        let _ = (scope, target, wait);
    }

    /// A call was denied with no fallback available.
    fn record_rejection(&self, scope: &str, target: &str) {
        let _ = (scope, target);
    }

    /// A limiter was evicted from the registry (idle or capacity pressure).
    fn record_eviction(&self, scope: &str, target: &str, rate: f64) {
        let _ = (scope, target, rate);
    }

    /// Snapshot of a limiter's available permits, taken per call.
    fn record_available_permits(&self, scope: &str, target: &str, permits: f64) {
        let _ = (scope, target, permits);
    }

    /// A cache read was served from the cache (positive or tombstone).
    fn record_cache_hit(&self, cache: &str) {
        let _ = cache;
    }

    /// A cache read missed and took the reload path.
    fn record_cache_miss(&self, cache: &str) {
        let _ = cache;
    }

    /// A cache read bypassed the cache entirely (degraded mode).
    fn record_cache_bypass(&self, cache: &str) {
        let _ = cache;
    }

    /// Outcome and wait time of a lock acquisition attempt.
    fn record_lock_acquire(&self, acquired: bool, wait: Duration) {
        let _ = (acquired, wait);
    }

    /// A lock was released by its holder.
    fn record_lock_release(&self) {}
}

/// A sink that drops every observation. The default wiring for tests and
/// for deployments without a metrics backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// [`MetricsSink`] backed by a Prometheus registry.
///
/// Exposes the admission-layer metric families:
///
/// | metric | kind | labels |
/// |---|---|---|
/// | `limiter_wait_time` | histogram (seconds) | `type`, `target` |
/// | `limiter_rejected_total` | counter | `type`, `target` |
/// | `limiter_removed_total` | counter | `type`, `target` |
/// | `limiter_available_permits` | gauge | `type`, `target` |
/// | `cache_hits_total` / `cache_misses_total` / `cache_bypass_total` | counter | `cache` |
/// | `lock_acquire_total` | counter | `outcome` |
/// | `lock_release_total` | counter | (none) |
/// | `lock_wait_time` | histogram (seconds) | (none) |
pub struct PrometheusMetrics {
    wait_time: HistogramVec,
    rejected: IntCounterVec,
    removed: IntCounterVec,
    available_permits: GaugeVec,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    cache_bypass: IntCounterVec,
    lock_acquire: IntCounterVec,
    lock_release: IntCounter,
    lock_wait: Histogram,
}

impl PrometheusMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// Fails only on duplicate registration, which indicates two admission
    /// stacks sharing one registry, which is a wiring mistake.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let limiter_labels = ["type", "target"];

        let wait_time = HistogramVec::new(
            HistogramOpts::new("limiter_wait_time", "Time spent waiting for a rate-limit permit"),
            &limiter_labels,
        )?;
        let rejected = IntCounterVec::new(
            Opts::new("limiter_rejected_total", "Requests denied by the rate limiter"),
            &limiter_labels,
        )?;
        let removed = IntCounterVec::new(
            Opts::new("limiter_removed_total", "Limiters evicted from the registry"),
            &limiter_labels,
        )?;
        let available_permits = GaugeVec::new(
            Opts::new("limiter_available_permits", "Available permits per limiter"),
            &limiter_labels,
        )?;
        let cache_hits = IntCounterVec::new(
            Opts::new("cache_hits_total", "Cache reads served from the cache"),
            &["cache"],
        )?;
        let cache_misses = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache reads that took the reload path"),
            &["cache"],
        )?;
        let cache_bypass = IntCounterVec::new(
            Opts::new("cache_bypass_total", "Cache reads served directly from storage"),
            &["cache"],
        )?;
        let lock_acquire = IntCounterVec::new(
            Opts::new("lock_acquire_total", "Lock acquisition attempts by outcome"),
            &["outcome"],
        )?;
        // These two carry no labels, so they are plain instruments rather
        // than single-child families.
        let lock_release =
            IntCounter::new("lock_release_total", "Lock releases by the holder")?;
        let lock_wait = Histogram::with_opts(HistogramOpts::new(
            "lock_wait_time",
            "Time spent waiting for a lock",
        ))?;

        registry.register(Box::new(wait_time.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(removed.clone()))?;
        registry.register(Box::new(available_permits.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_bypass.clone()))?;
        registry.register(Box::new(lock_acquire.clone()))?;
        registry.register(Box::new(lock_release.clone()))?;
        registry.register(Box::new(lock_wait.clone()))?;

        Ok(Self {
            wait_time,
            rejected,
            removed,
            available_permits,
            cache_hits,
            cache_misses,
            cache_bypass,
            lock_acquire,
            lock_release,
            lock_wait,
        })
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_wait_time(&self, scope: &str, target: &str, wait: Duration) {
        self.wait_time
            .with_label_values(&[scope, target])
            .observe(wait.as_secs_f64());
    }

    fn record_rejection(&self, scope: &str, target: &str) {
        self.rejected.with_label_values(&[scope, target]).inc();
    }

    fn record_eviction(&self, scope: &str, target: &str, _rate: f64) {
        self.removed.with_label_values(&[scope, target]).inc();
        // Drop the gauge child so evicted limiters disappear from scrapes
        // instead of flat-lining at their last value.
        let _ = self.available_permits.remove_label_values(&[scope, target]);
    }

    fn record_available_permits(&self, scope: &str, target: &str, permits: f64) {
        self.available_permits
            .with_label_values(&[scope, target])
            .set(permits);
    }

    fn record_cache_hit(&self, cache: &str) {
        self.cache_hits.with_label_values(&[cache]).inc();
    }

    fn record_cache_miss(&self, cache: &str) {
        self.cache_misses.with_label_values(&[cache]).inc();
    }

    fn record_cache_bypass(&self, cache: &str) {
        self.cache_bypass.with_label_values(&[cache]).inc();
    }

    fn record_lock_acquire(&self, acquired: bool, wait: Duration) {
        let outcome = if acquired { "acquired" } else { "timeout" };
        self.lock_acquire.with_label_values(&[outcome]).inc();
        self.lock_wait.observe(wait.as_secs_f64());
    }

    fn record_lock_release(&self) {
        self.lock_release.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn scrape(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_noop_accepts_everything() {
        let sink = NoopMetrics;
        sink.record_wait_time("GLOBAL", "GLOBAL", Duration::from_millis(5));
        sink.record_rejection("USER", "42");
        sink.record_cache_hit("user");
        sink.record_lock_acquire(false, Duration::ZERO);
    }

    #[test]
    fn test_prometheus_families_register_and_record() {
        let registry = Registry::new();
        let sink = PrometheusMetrics::new(&registry).unwrap();

        sink.record_wait_time("INTERFACE", "UserService.login", Duration::from_millis(12));
        sink.record_rejection("INTERFACE", "UserService.login");
        sink.record_rejection("INTERFACE", "UserService.login");
        sink.record_available_permits("INTERFACE", "UserService.login", 3.5);
        sink.record_cache_miss("user");
        sink.record_lock_acquire(true, Duration::from_millis(1));
        sink.record_lock_release();

        let text = scrape(&registry);
        assert!(text.contains(
            r#"limiter_rejected_total{target="UserService.login",type="INTERFACE"} 2"#
        ));
        assert!(text.contains(r#"cache_misses_total{cache="user"} 1"#));
        assert!(text.contains(r#"lock_acquire_total{outcome="acquired"} 1"#));
        // The label-free instruments record without any child lookup.
        assert!(text.contains("lock_release_total 1"));
        assert!(text.contains("lock_wait_time_count 1"));
    }

    #[test]
    fn test_eviction_removes_gauge_child() {
        let registry = Registry::new();
        let sink = PrometheusMetrics::new(&registry).unwrap();

        sink.record_available_permits("USER", "42", 5.0);
        assert!(scrape(&registry).contains(r#"limiter_available_permits{target="42",type="USER"}"#));

        sink.record_eviction("USER", "42", 5.0);
        let text = scrape(&registry);
        assert!(!text.contains(r#"limiter_available_permits{target="42",type="USER"}"#));
        assert!(text.contains(r#"limiter_removed_total{target="42",type="USER"} 1"#));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        assert!(PrometheusMetrics::new(&registry).is_ok());
        assert!(PrometheusMetrics::new(&registry).is_err());
    }
}
