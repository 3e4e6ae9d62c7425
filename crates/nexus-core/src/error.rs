use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the entire Nexus broker.
#[derive(Error, Debug)]
pub enum NexusError {
    // ── Configuration errors ───────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    // ── Registry errors ────────────────────────────────────────
    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider unavailable: {provider}: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("provider '{provider}' does not declare context type '{context_type}'")]
    UndeclaredContextType {
        provider: String,
        context_type: String,
    },

    // ── Access errors ──────────────────────────────────────────
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("no accessible context for request")]
    NoAccessibleContext,

    // ── Action errors ──────────────────────────────────────────
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("action already submitted: {0}")]
    DuplicateAction(Uuid),

    #[error("action not found: {0}")]
    ActionNotFound(Uuid),

    #[error("action blocked: {action_id}: {reasons}")]
    ActionBlocked { action_id: Uuid, reasons: String },

    #[error("action rejected: {action_id}: {reason}")]
    ActionRejected { action_id: Uuid, reason: String },

    #[error("invalid state transition for {action_id}: {from} -> {to}")]
    InvalidTransition {
        action_id: Uuid,
        from: String,
        to: String,
    },

    #[error("action {action_id} cannot be cancelled while {state}")]
    NotCancellable { action_id: Uuid, state: String },

    #[error("no executor registered for action kind: {0}")]
    ExecutorNotFound(String),

    #[error("execution failed: {action_id}: {reason}")]
    ExecutionFailure { action_id: Uuid, reason: String },

    #[error("rollback failed: {action_id}: {reason}")]
    RollbackFailure { action_id: Uuid, reason: String },

    #[error("rollback refused: action {0} is declared irreversible")]
    IrreversibleRollback(Uuid),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    // ── Approval errors ────────────────────────────────────────
    #[error("approval not found or already resolved: {0}")]
    ApprovalNotFound(Uuid),

    // ── Audit errors ───────────────────────────────────────────
    #[error("audit integrity failure at seq {seq}: {reason}")]
    AuditIntegrity { seq: u64, reason: String },

    #[error("audit log halted: {0}")]
    AuditHalted(String),

    #[error("storage error: {0}")]
    Storage(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl NexusError {
    /// Errors rejected synchronously at the API boundary because the input
    /// itself is malformed.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigValidation { .. }
                | Self::MalformedDescriptor(_)
                | Self::InvalidAction(_)
                | Self::UndeclaredContextType { .. }
        )
    }

    /// HTTP status code hint for the API layer.
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::Config(_)
            | Self::ConfigValidation { .. }
            | Self::MalformedDescriptor(_)
            | Self::InvalidAction(_)
            | Self::UndeclaredContextType { .. }
            | Self::IrreversibleRollback(_) => 400,
            Self::AccessDenied(_) | Self::NoAccessibleContext => 403,
            Self::ProviderNotFound(_)
            | Self::ActionNotFound(_)
            | Self::SnapshotNotFound(_)
            | Self::ApprovalNotFound(_)
            | Self::ExecutorNotFound(_) => 404,
            Self::DuplicateProvider(_)
            | Self::DuplicateAction(_)
            | Self::InvalidTransition { .. }
            | Self::NotCancellable { .. }
            | Self::ActionBlocked { .. }
            | Self::ActionRejected { .. } => 409,
            Self::ResourceBusy(_) => 423,
            Self::ProviderUnavailable { .. } | Self::AuditHalted(_) => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, NexusError>;
