//! # Turnstile - Admission Control for Request-Serving Backends
//!
//! Turnstile is the traffic layer that sits between your API surface and
//! your business logic: it decides which calls run now, which wait, which
//! degrade to a fallback, and which are turned away with a retry hint.
//!
//! ## What's in the box
//!
//! - **Three-tier rate limiting** - one global bucket for the process, one
//!   bucket per operation, one bucket per user, all created lazily and
//!   evicted when idle
//! - **Warm-up ramps** - a freshly started process admits traffic
//!   gradually instead of unleashing its full rate on cold caches
//! - **Fleet-wide limits** - an optional shared-store token bucket caps
//!   the sum of all processes, not just each one
//! - **Distributed and local locking** - one trait, two implementations,
//!   both leased so a dead holder cannot wedge a key
//! - **Stampede-safe caching** - jittered TTLs, tombstones for confirmed
//!   misses, and single-flight reloads
//! - **Metrics** - every component reports through one sink trait, with a
//!   Prometheus adapter included
//!
//! ## The big picture
//!
//! ```text
//!     Request
//!        │
//!        ▼
//!     ┌──────────────────────┐
//!     │ AdmissionController  │ ◄── policy: scope, rate, timeout, fallback
//!     └──────────┬───────────┘
//!                │ admit?
//!        ┌───────┴────────────────────┐
//!        ▼                            ▼
//!     ┌─────────────────┐      ┌──────────────────────┐
//!     │ LimiterRegistry │      │ DistributedTokenBucket│
//!     │ GLOBAL /        │      │ (shared store,        │
//!     │ INTERFACE / USER│      │  fail-open)           │
//!     └─────────────────┘      └──────────────────────┘
//!                │
//!        admitted: run the operation
//!        denied:   fallback, or Err(Denied { retry hint })
//! ```
//!
//! ## Quick start
//!
//! ### Guarding an operation
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{
//!     AdmissionConfig, AdmissionController, AdmissionPolicy, CallContext,
//!     InMemoryStore, NoopMetrics, RateLimitScope,
//! };
//!
//! let controller = AdmissionController::new(
//!     AdmissionConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(NoopMetrics),
//! )?;
//!
//! let ctx = CallContext::new("UserService.profile").with_subject("42");
//! let policy = AdmissionPolicy::scoped(RateLimitScope::User);
//!
//! let profile = controller.run(&ctx, &policy, || "fresh profile", None)?;
//! assert_eq!(profile, "fresh profile");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Degrading instead of failing
//!
//! ```rust
//! # use std::sync::Arc;
//! # use turnstile::{AdmissionConfig, AdmissionController, AdmissionPolicy,
//! #     CallContext, Denial, InMemoryStore, NoopMetrics, RateLimitScope};
//! # let controller = AdmissionController::new(AdmissionConfig::default(),
//! #     Arc::new(InMemoryStore::new()), Arc::new(NoopMetrics)).unwrap();
//! let ctx = CallContext::new("FeedService.home").with_subject("42");
//! let policy = AdmissionPolicy::scoped(RateLimitScope::User);
//!
//! // When the user's bucket is empty, serve the cached feed instead of a 429.
//! let fallback = |_: &Denial| "cached feed".to_string();
//! let feed = controller
//!     .run(&ctx, &policy, || "fresh feed".to_string(), Some(&fallback))
//!     .unwrap();
//! ```
//!
//! ### A bare token bucket
//!
//! ```rust
//! use turnstile::TokenBucket;
//!
//! // 10 permits per second, burst of 10.
//! let bucket = TokenBucket::new(10.0, None);
//! if bucket.try_acquire() {
//!     // admitted
//! }
//! ```
//!
//! ## Module map
//!
//! ```text
//!     src/
//!     ├── admission/   (controller, policies, fallbacks)
//!     ├── limiter/     (token bucket, registry, fleet-wide bucket)
//!     ├── lock/        (LockService: local and distributed)
//!     ├── cache/       (stampede-safe read-through cache)
//!     ├── store.rs     (SharedStore trait + in-memory implementation)
//!     ├── metrics.rs   (MetricsSink trait + Prometheus adapter)
//!     ├── config.rs    (one validated configuration tree)
//!     └── error.rs     (the few things that are actually errors)
//! ```
//!
//! ## Design notes
//!
//! Contention is never an error here: an empty bucket or a contended lock
//! answers `false`, and only a denial that reaches the caller becomes
//! [`AdmissionError::Denied`]. Coordination infrastructure failing is
//! handled asymmetrically: rate limiting fails open (the local tiers keep
//! protecting), locking fails closed, and the cache degrades to direct
//! loads.

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

mod admission;
mod cache;
mod config;
mod error;
mod limiter;
mod lock;
mod metrics;
mod store;
mod utils;

pub use admission::{
    AdmissionController, AdmissionPolicy, CallContext, Denial, Fallback, RateLimitScope,
};
pub use cache::StampedeSafeCache;
pub use config::{
    AdmissionConfig, CacheConfig, DistributedConfig, LockMode, RegistryConfig,
};
pub use error::{AdmissionError, ConfigError};
pub use limiter::{
    AcquireTimeout, DistributedTokenBucket, LimiterRegistry, TokenBucket, VersionedLimiter,
};
pub use lock::{
    lock_service_for, with_lock, DistributedLockService, LocalLockService, LockPolicy,
    LockService,
};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use store::{InMemoryStore, PermitScriptArgs, SharedStore, StoreError};
pub use utils::current_time_ms;

/// An admission controller wrapped in `Arc` for sharing across request
/// handlers.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use turnstile::{AdmissionConfig, AdmissionController, InMemoryStore,
///     NoopMetrics, SharedController};
///
/// let controller: SharedController = Arc::new(AdmissionController::new(
///     AdmissionConfig::default(),
///     Arc::new(InMemoryStore::new()),
///     Arc::new(NoopMetrics),
/// )?);
///
/// let handle = controller.clone();
/// std::thread::spawn(move || {
///     let _ = handle.registry().len();
/// });
/// # Ok::<(), turnstile::ConfigError>(())
/// ```
pub type SharedController = std::sync::Arc<AdmissionController>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.75.0";

/// Prelude module for convenient imports.
///
/// Import everything a typical call site needs with a single line:
/// ```rust
/// use turnstile::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical admission-control use cases.
    //!
    //! # Example
    //! ```rust
    //! use std::sync::Arc;
    //! use turnstile::prelude::*;
    //!
    //! let controller = AdmissionController::new(
    //!     AdmissionConfig::default(),
    //!     Arc::new(InMemoryStore::new()),
    //!     Arc::new(NoopMetrics),
    //! ).unwrap();
    //! ```

    pub use crate::{
        AdmissionConfig, AdmissionController, AdmissionError, AdmissionPolicy, CallContext,
        Denial, InMemoryStore, LockPolicy, LockService, MetricsSink, NoopMetrics,
        RateLimitScope, SharedController, SharedStore, StampedeSafeCache, TokenBucket,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_crate_wires_together() {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let controller = AdmissionController::new(
            AdmissionConfig::default(),
            store,
            Arc::new(NoopMetrics),
        )
        .unwrap();

        let ctx = CallContext::new("Smoke.test").with_subject("1");
        let policy = AdmissionPolicy::scoped(RateLimitScope::User);
        assert_eq!(controller.run(&ctx, &policy, || 42, None).unwrap(), 42);
    }

    #[test]
    fn test_version_constants_are_populated() {
        assert!(!VERSION.is_empty());
        assert!(MSRV.starts_with("1."));
    }
}
