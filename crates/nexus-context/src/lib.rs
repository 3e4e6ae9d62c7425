//! # nexus-context
//!
//! The context side of the broker: providers register and heartbeat with
//! the [`ProviderRegistry`], the [`PermissionGuard`] decides who may read
//! what, and the [`ContextRouter`] fans a request out to the permitted
//! providers and returns a bounded, relevance-ranked result.

pub mod cache;
pub mod guard;
pub mod mock;
pub mod ratelimit;
pub mod registry;
pub mod relevance;
pub mod router;

pub use cache::{CacheInsert, ContextCache};
pub use guard::{AccessDecision, PermissionGuard, RATE_LIMITED};
pub use ratelimit::SlidingWindowLimiter;
pub use registry::{Provider, ProviderRegistry, ProviderStats, SweepReport};
pub use relevance::RelevanceScorer;
pub use router::ContextRouter;
