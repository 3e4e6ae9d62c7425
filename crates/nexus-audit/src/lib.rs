//! # nexus-audit
//!
//! Append-only, tamper-evident audit log. Every entry carries the blake3
//! hash of its predecessor, so any gap, reorder, or edit is detectable by
//! re-walking the chain. Entries can be flushed to SQLite and the chain
//! resumed from the stored head after a restart.

pub mod chain;
pub mod entry;
pub mod log;
pub mod store;

pub use chain::{ChainAnchor, ChainReport, verify_chain};
pub use entry::{AuditEntry, AuditKind, GENESIS_HASH};
pub use log::{AuditLog, AuditPage};
pub use store::AuditStore;
