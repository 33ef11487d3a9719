//! Token-bucket rate limiting: the single-key primitive, the keyed
//! registry behind the per-interface and per-user tiers, and the
//! fleet-wide bucket coordinated through the shared store.

mod bucket;
mod distributed;
mod registry;

pub use bucket::{AcquireTimeout, TokenBucket};
pub use distributed::DistributedTokenBucket;
pub use registry::{LimiterRegistry, VersionedLimiter};
