//! # nexus-config
//!
//! Configuration system for the Nexus broker. Reads from `nexus.toml` and
//! environment variables, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher; subscribers receive every
//! successfully validated revision.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::NexusConfig;
pub use schema::{
    ApprovalConfig, AuditConfig, EngineConfig, ImpactWeights, LoggingConfig, PermissionsConfig,
    RegistryConfig, RollbackConfig, RouterConfig, SafetyConfig, ServerConfig, TimeoutPolicy,
    TrustWeights,
};
pub use schema::{ConfigWarning, WarningSeverity};
