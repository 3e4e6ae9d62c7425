//! # nexus-core
//!
//! Core types, traits, and primitives for the Nexus context broker and
//! autonomy engine. This crate defines the shared vocabulary used by every
//! other crate in the workspace: the error taxonomy, the data model, and the
//! seams where external collaborators (context providers, action executors)
//! plug in.

pub mod action;
pub mod context;
pub mod error;
pub mod event;
pub mod policy;
pub mod time;
pub mod types;

pub use action::{
    ActionExecutor, ActionFailure, ActionReport, ActionState, Decision, DecisionOutcome,
    ProposedAction, RiskFactor, RollbackOutcome, StateTransition,
};
pub use context::{
    ContextFilters, ContextProvider, ContextRecord, ContextRequest, ContextResponse,
    ProviderDescriptor,
};
pub use error::{NexusError, Result};
pub use event::{Event, EventBus};
pub use policy::{PermissionRule, PolicyOverride, RateLimit, RuleConditions, WILDCARD};
pub use time::{MAX_SPAN_SECS, add_span, span_secs, sub_span};
pub use types::*;
