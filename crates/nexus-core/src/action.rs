use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::types::{
    ActionId, ConsumerId, ImpactTier, PendingId, Reversibility, SnapshotId,
};

/// A structured request to perform a system-affecting operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    #[serde(default = "Uuid::new_v4")]
    pub id: ActionId,
    pub consumer: ConsumerId,
    /// Selects the executor, e.g. "file_op", "config_change", "network_op".
    pub kind: String,
    /// The resource the action mutates. Conflicting actions serialize on it.
    pub target: String,
    #[serde(default)]
    pub parameters: Value,
    pub reversibility: Reversibility,
    pub impact: ImpactTier,
    /// Links retries of the same logical action. Defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Context types to gather for the assessment. Empty = engine defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_types: Vec<String>,
}

impl ProposedAction {
    pub fn new(
        consumer: impl Into<String>,
        kind: impl Into<String>,
        target: impl Into<String>,
        reversibility: Reversibility,
        impact: ImpactTier,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            consumer: consumer.into(),
            kind: kind.into(),
            target: target.into(),
            parameters: Value::Null,
            reversibility,
            impact,
            correlation_id: None,
            context_types: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// A new attempt of `self` with a fresh id, linked by correlation id.
    pub fn retry(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: Some(self.correlation_id()),
            ..self.clone()
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id.unwrap_or(self.id)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.consumer.trim().is_empty() {
            return Err(crate::NexusError::InvalidAction("consumer is empty".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(crate::NexusError::InvalidAction("kind is empty".into()));
        }
        if self.target.trim().is_empty() {
            return Err(crate::NexusError::InvalidAction("target is empty".into()));
        }
        Ok(())
    }
}

/// Outcome bands of a safety assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    AutoApproved,
    ApprovalRequired,
    Blocked,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoApproved => "auto_approved",
            Self::ApprovalRequired => "approval_required",
            Self::Blocked => "blocked",
        })
    }
}

/// A scoring factor that fired during assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "factor", rename_all = "snake_case")]
pub enum RiskFactor {
    Impact { tier: ImpactTier, weight: f64 },
    PartiallyReversible { weight: f64 },
    IrreversibleFloor { floor: f64 },
    IrreversibleNeverAuto,
    DenyKeyword { keyword: String, weight: f64 },
    FlagKeyword { keyword: String, weight: f64 },
    SensitiveContext { records: usize, weight: f64 },
    ConsumerAdjustment { consumer: String, adjustment: f64 },
    ConsumerForcedApproval { consumer: String },
    ConsumerBlocked { consumer: String },
}

impl fmt::Display for RiskFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Impact { tier, weight } => {
                write!(f, "declared impact '{tier}' contributes {weight:.2}")
            }
            Self::PartiallyReversible { weight } => {
                write!(f, "action is only partially reversible (+{weight:.2})")
            }
            Self::IrreversibleFloor { floor } => {
                write!(f, "action is irreversible; risk floor {floor:.2} applied")
            }
            Self::IrreversibleNeverAuto => {
                f.write_str("irreversible actions are never auto-approved")
            }
            Self::DenyKeyword { keyword, weight } => {
                write!(f, "target matches denied keyword '{keyword}' (+{weight:.2})")
            }
            Self::FlagKeyword { keyword, weight } => {
                write!(f, "target matches security-relevant keyword '{keyword}' (+{weight:.2})")
            }
            Self::SensitiveContext { records, weight } => {
                write!(f, "{records} sensitive context record(s) in scope (+{weight:.2})")
            }
            Self::ConsumerAdjustment {
                consumer,
                adjustment,
            } => write!(f, "policy override for '{consumer}' adjusts risk by {adjustment:+.2}"),
            Self::ConsumerForcedApproval { consumer } => {
                write!(f, "policy override requires approval for '{consumer}'")
            }
            Self::ConsumerBlocked { consumer } => {
                write!(f, "policy override blocks all actions from '{consumer}'")
            }
        }
    }
}

/// Immutable record of one assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action_id: ActionId,
    pub correlation_id: Uuid,
    pub outcome: DecisionOutcome,
    /// 0.0–1.0.
    pub risk_score: f64,
    /// Ordered list of the factors that fired.
    pub reasons: Vec<RiskFactor>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// Per-action orchestration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Received,
    ContextGathered,
    Assessed,
    AwaitingApproval,
    Executing,
    Rejected,
    Cancelled,
    Completed,
    RolledBack,
    Failed,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Cancelled | Self::Completed | Self::RolledBack | Self::Failed
        )
    }

    /// States a caller may cancel from.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Received | Self::ContextGathered | Self::Assessed | Self::AwaitingApproval
        )
    }

    pub fn can_transition_to(&self, next: ActionState) -> bool {
        use ActionState::*;
        match (self, next) {
            (Received, ContextGathered) => true,
            (ContextGathered, Assessed) => true,
            (Assessed, Executing | AwaitingApproval | Rejected) => true,
            (AwaitingApproval, Executing | Rejected) => true,
            (Executing, Completed | RolledBack | Failed) => true,
            // Post-completion rollback requested by an operator.
            (Completed, RolledBack | Failed) => true,
            (s, Cancelled) => s.is_cancellable(),
            _ => false,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::ContextGathered => "context_gathered",
            Self::Assessed => "assessed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: ActionState,
    pub at: DateTime<Utc>,
}

/// Why an action ended up `RolledBack` or `Failed`. Rollback failures are
/// kept distinct so they are never mistaken for a plain execution error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionFailure {
    Execution {
        reason: String,
    },
    Rollback {
        execution_reason: String,
        rollback_reason: String,
    },
}

/// Result of asking for a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// `noop` is true when the snapshot had already been rolled back.
    RolledBack { noop: bool },
    Failed { reason: String },
}

impl RollbackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

/// What the engine tells a caller about an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub action_id: ActionId,
    pub consumer: ConsumerId,
    pub target: String,
    pub state: ActionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_id: Option<PendingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ActionFailure>,
    /// Rejection or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub history: Vec<StateTransition>,
}

/// Downstream collaborator that performs one kind of action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The action kind this executor handles.
    fn kind(&self) -> &str;

    /// Perform the action.
    async fn execute(&self, action: &ProposedAction) -> crate::Result<Value>;

    /// Capture the current state of the action's target.
    async fn capture_state(&self, action: &ProposedAction) -> crate::Result<Value>;

    /// Put the target back into a previously captured state.
    async fn restore_state(&self, action: &ProposedAction, state: &Value) -> crate::Result<()>;
}
