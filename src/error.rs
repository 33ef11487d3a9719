//! Error taxonomy for the admission layer.
//!
//! Expected contention outcomes (no permits, lock not acquired in time) are
//! *values*, not errors: `TokenBucket::try_acquire` and
//! `LockService::try_lock` return `false` and never fail. The types here
//! cover the cases that must reach a caller as a structured signal:
//!
//! - [`AdmissionError::Denied`] - rate limit exhausted with no fallback
//!   registered; carries the scope, target, and a retry hint.
//! - [`AdmissionError::LockUnavailable`] - a lock-wrapped operation could
//!   not take its lease within the wait bound.
//! - [`ConfigError`] - invalid configuration, fatal at construction time.
//!
//! A release attempted by a non-holder ("lock misuse") is deliberately *not*
//! represented here: it is logged and ignored, since a caller logic error
//! should not take down the request that tripped over it.

use std::time::Duration;
use thiserror::Error;

/// Failure surfaced by the admission layer to a protected operation's caller.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The rate limit for the resolved scope is exhausted and no fallback
    /// was registered. The retry hint is surfaced to external callers in
    /// whole seconds, rounded up.
    #[error("too many requests for {scope}:{target}, retry after {}s", .retry_after.as_millis().div_ceil(1000))]
    Denied {
        /// Limiter type that denied the call (`GLOBAL`, `INTERFACE`, `USER`).
        scope: &'static str,
        /// The effective limit target (operation identity or subject).
        target: String,
        /// Suggested delay before retrying.
        retry_after: Duration,
        /// Time spent waiting for a permit before the denial.
        waited: Duration,
    },

    /// A mutual-exclusion lease could not be acquired within its wait bound.
    ///
    /// Whether this is an error at all is a caller-local decision; some
    /// components (the stampede-safe cache) degrade instead of surfacing it.
    #[error("could not acquire lock '{key}' within the wait bound")]
    LockUnavailable {
        /// The lock key that was contended.
        key: String,
    },
}

impl AdmissionError {
    /// Suggested retry delay in whole seconds, rounded up from the internal
    /// millisecond value. `1` for lock unavailability.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Denied { retry_after, .. } => {
                (retry_after.as_millis() as u64).div_ceil(1000)
            }
            Self::LockUnavailable { .. } => 1,
        }
    }
}

/// Invalid configuration, detected at construction time.
///
/// Configuration errors are a fatal misconfiguration of the deployment, not
/// a runtime condition: components either validate eagerly and return this,
/// or panic when constructed from an unvalidated config (documented per
/// constructor).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
