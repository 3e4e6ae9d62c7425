//! # nexus-runtime
//!
//! The broker process core. [`Broker`] builds every component from one
//! [`NexusConfig`](nexus_config::NexusConfig), shares them by `Arc`, and
//! drives their time-based work:
//!
//! ```text
//!   liveness      registry sweep → purge caches → evict stale pushes
//!   approvals     expired approvals settled by timeout policy
//!   audit-flush   persist new entries, compact memory
//!   audit-verify  re-walk the chain; halt on tamper
//!   housekeeping  rate windows, snapshot retention, settled actions, locks
//! ```

pub mod broker;

pub use broker::{Broker, HousekeepingReport};
