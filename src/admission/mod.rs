//! The interception point: admit, run, or degrade.
//!
//! [`AdmissionController::run`] wraps a protected operation. Before the
//! operation executes, the call is checked against the limiter tier its
//! policy names:
//!
//! - `GLOBAL` - one process-wide bucket, warm-up aware;
//! - `INTERFACE` - one bucket per operation identity;
//! - `USER` - one bucket per subject, falling back to the `INTERFACE`
//!   tier when the call has no subject (unauthenticated traffic still
//!   gets limited, just coarser).
//!
//! A call that clears its local tier may additionally be checked against
//! the fleet-wide bucket in the shared store. On denial, a registered
//! [`Fallback`] produces a degraded answer and the call still "succeeds";
//! without one the caller receives [`AdmissionError::Denied`] carrying a
//! retry hint. Denials are counted only when they surface to the caller:
//! a served fallback is degradation, not rejection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, ConfigError};
use crate::limiter::{AcquireTimeout, DistributedTokenBucket, LimiterRegistry, TokenBucket};
use crate::metrics::MetricsSink;
use crate::store::SharedStore;

/// Retry hint attached to every denial. One second always rounds to
/// itself, which keeps `Retry-After` rendering trivial at the edge.
const RETRY_AFTER: Duration = Duration::from_secs(1);

/// Which limiter tier a policy targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// The single process-wide limiter.
    Global,
    /// One limiter per operation identity.
    Interface,
    /// One limiter per subject, keyed by [`CallContext::subject`].
    User,
}

impl RateLimitScope {
    /// The tier's name as used in limiter keys and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Interface => "INTERFACE",
            Self::User => "USER",
        }
    }
}

/// Identity of one protected call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Operation identity, conventionally `Service.method`.
    pub operation: String,
    /// The subject (user, account) on whose behalf the call runs, when
    /// known.
    pub subject: Option<String>,
}

impl CallContext {
    /// Context for an operation with no subject.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            subject: None,
        }
    }

    /// Attaches the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// How one call site is limited.
///
/// ```rust
/// use turnstile::{AdmissionPolicy, RateLimitScope};
///
/// // 20 QPS per user, waiting up to 100 ms for a permit.
/// let policy = AdmissionPolicy {
///     qps: Some(20.0),
///     timeout_ms: Some(100),
///     ..AdmissionPolicy::scoped(RateLimitScope::User)
/// };
/// ```
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// The tier this call site is limited by.
    pub scope: RateLimitScope,
    /// Sustained rate override. `None` uses the configured default of the
    /// tier: `global_qps` for `GLOBAL` and `INTERFACE`, `user_qps` for
    /// `USER`.
    pub qps: Option<f64>,
    /// Permits this call consumes. Heavier operations may weigh more.
    pub permits: u32,
    /// Acquisition timeout in the signed-millisecond convention, `None`
    /// using the configured default.
    pub timeout_ms: Option<i64>,
    /// Warm-up ramp for this call site's limiter. `None` leaves warm-up to
    /// the tier default: the configured global ramp for `GLOBAL`, none for
    /// the others.
    pub warmup: Option<Duration>,
    /// Also debit the fleet-wide bucket after the local grant. Ignored
    /// when distributed limiting is disabled in the configuration.
    pub distributed: bool,
}

impl AdmissionPolicy {
    /// A single-permit policy for the given tier, defaults everywhere else.
    pub fn scoped(scope: RateLimitScope) -> Self {
        Self {
            scope,
            qps: None,
            permits: 1,
            timeout_ms: None,
            warmup: None,
            distributed: false,
        }
    }
}

/// A denial, as handed to a [`Fallback`].
#[derive(Debug, Clone)]
pub struct Denial {
    /// Tier that denied the call.
    pub scope: &'static str,
    /// The effective limit target.
    pub target: String,
    /// Time spent waiting before the denial.
    pub waited: Duration,
    /// Suggested delay before retrying.
    pub retry_after: Duration,
}

/// Degraded answer for a denied call.
///
/// Any `Fn(&Denial) -> T` qualifies, so most call sites pass a closure:
///
/// ```rust
/// use turnstile::Denial;
///
/// let cached_profile = |_: &Denial| "profile from cache".to_string();
/// ```
pub trait Fallback<T>: Send + Sync {
    /// Produces the degraded result.
    fn handle(&self, denial: &Denial) -> T;
}

impl<T, F> Fallback<T> for F
where
    F: Fn(&Denial) -> T + Send + Sync,
{
    fn handle(&self, denial: &Denial) -> T {
        self(denial)
    }
}

/// Front door of the admission layer. See the [module docs](self).
///
/// One controller serves a whole process; it is `Send + Sync` and every
/// method takes `&self`.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    registry: Arc<LimiterRegistry>,
    distributed: DistributedTokenBucket,
    metrics: Arc<dyn MetricsSink>,
}

impl AdmissionController {
    /// Validates `config` and builds the controller over the given store
    /// and metrics sink.
    pub fn new(
        config: AdmissionConfig,
        store: Arc<dyn SharedStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(LimiterRegistry::new(
            config.registry.clone(),
            Arc::clone(&metrics),
        ));
        let distributed = DistributedTokenBucket::new(store, &config.distributed);
        Ok(Self {
            config,
            registry,
            distributed,
            metrics,
        })
    }

    /// The limiter registry, shared for introspection and for starting its
    /// cleanup thread.
    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Admits and runs `op`, or degrades through `fallback`.
    ///
    /// Exactly one of three things happens:
    ///
    /// 1. admitted: `op` runs, its result is returned;
    /// 2. denied with a fallback: `fallback` runs, its result is
    ///    returned as success;
    /// 3. denied without one: [`AdmissionError::Denied`] is returned and
    ///    the rejection is counted.
    pub fn run<T>(
        &self,
        ctx: &CallContext,
        policy: &AdmissionPolicy,
        op: impl FnOnce() -> T,
        fallback: Option<&dyn Fallback<T>>,
    ) -> Result<T, AdmissionError> {
        match self.try_admit(ctx, policy) {
            Ok(()) => Ok(op()),
            Err(denial) => match fallback {
                Some(fallback) => {
                    debug!(
                        scope = denial.scope,
                        target = %denial.target,
                        "rate limited, serving fallback"
                    );
                    Ok(fallback.handle(&denial))
                }
                None => {
                    self.metrics.record_rejection(denial.scope, &denial.target);
                    Err(AdmissionError::Denied {
                        scope: denial.scope,
                        target: denial.target,
                        retry_after: denial.retry_after,
                        waited: denial.waited,
                    })
                }
            },
        }
    }

    /// Checks the call against its tier (and the fleet bucket if asked)
    /// without running anything. Permits are debited on success.
    pub fn try_admit(&self, ctx: &CallContext, policy: &AdmissionPolicy) -> Result<(), Denial> {
        let (scope, target) = self.resolve(ctx, policy);
        let qps = policy.qps.unwrap_or(match scope {
            RateLimitScope::User => self.config.user_qps,
            _ => self.config.global_qps,
        });
        let bucket = self.bucket_for(scope, &target, qps, policy);
        let scope_name = scope.as_str();

        let timeout =
            AcquireTimeout::from_millis(policy.timeout_ms.unwrap_or(self.config.global_timeout_ms));
        let start = Instant::now();
        let granted = bucket.acquire(policy.permits, timeout);

        let granted = granted
            && (!policy.distributed
                || self.admit_distributed(scope_name, &target, qps, policy, timeout, start));

        let waited = start.elapsed();
        // Sampled after the acquire so the gauge includes this call's
        // debit.
        self.metrics
            .record_available_permits(scope_name, &target, bucket.available_permits());
        self.metrics.record_wait_time(scope_name, &target, waited);

        if granted {
            Ok(())
        } else {
            Err(Denial {
                scope: scope_name,
                target,
                waited,
                retry_after: RETRY_AFTER,
            })
        }
    }

    /// Resolves the effective tier and target. A `USER` policy without a
    /// subject coarsens to the `INTERFACE` tier.
    fn resolve(&self, ctx: &CallContext, policy: &AdmissionPolicy) -> (RateLimitScope, String) {
        match policy.scope {
            RateLimitScope::Global => (RateLimitScope::Global, "GLOBAL".to_string()),
            RateLimitScope::Interface => (RateLimitScope::Interface, ctx.operation.clone()),
            RateLimitScope::User => match &ctx.subject {
                Some(subject) => (RateLimitScope::User, subject.clone()),
                None => (RateLimitScope::Interface, ctx.operation.clone()),
            },
        }
    }

    fn bucket_for(
        &self,
        scope: RateLimitScope,
        target: &str,
        qps: f64,
        policy: &AdmissionPolicy,
    ) -> Arc<TokenBucket> {
        let key = format!("{}:{target}", scope.as_str());
        // Without an explicit ramp only the global tier warms up:
        // per-interface and per-user buckets come and go too often.
        let warmup = policy.warmup.or(match scope {
            RateLimitScope::Global => self.config.global_warmup(),
            _ => None,
        });
        self.registry.get_or_create(&key, qps, warmup)
    }

    /// Debits the fleet-wide bucket with whatever wait budget the local
    /// grant left over. Local permits are not refunded on a fleet denial;
    /// under-admitting a process briefly is the safe direction.
    fn admit_distributed(
        &self,
        scope: &str,
        target: &str,
        qps: f64,
        policy: &AdmissionPolicy,
        timeout: AcquireTimeout,
        start: Instant,
    ) -> bool {
        let remaining = match timeout {
            AcquireTimeout::Wait(total) => {
                let Some(left) = total.checked_sub(start.elapsed()) else {
                    return false;
                };
                AcquireTimeout::Wait(left)
            }
            other => other,
        };
        let key = format!("{scope}:{target}");
        self.distributed
            .try_acquire(&key, qps, policy.permits, remaining)
    }
}
