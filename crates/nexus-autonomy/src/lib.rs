//! # nexus-autonomy
//!
//! Everything between "a consumer proposed an action" and "the action ran
//! (or didn't)". The [`SafetyValidator`] scores the action, the
//! [`ApprovalGateway`] parks it for a human when needed, the
//! [`RollbackManager`] keeps the pre-action state, and the
//! [`AutonomyEngine`] drives each action through its state machine.

pub mod approval;
pub mod engine;
pub mod locks;
pub mod mock;
pub mod rollback;
pub mod safety;

pub use approval::{ApprovalGateway, ApprovalState, ExpiredApproval, PendingApproval};
pub use engine::AutonomyEngine;
pub use locks::ResourceLocks;
pub use rollback::{RollbackManager, Snapshot, SnapshotStatus};
pub use safety::SafetyValidator;
