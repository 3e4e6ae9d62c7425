use chrono::{DateTime, SecondsFormat, Utc};
use nexus_core::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// `prev_hash` of the first entry ever written.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    // Registry
    ProviderRegistered,
    ProviderDeregistered,
    ProviderDegraded,
    ProviderRecovered,
    ProviderUnreachable,
    ProviderPurged,
    // Access
    PermissionCheck,
    PermissionMutated,
    ClearanceMutated,
    ContextGathered,
    ContextPushed,
    // Actions
    ActionReceived,
    DecisionRecorded,
    ApprovalSubmitted,
    ApprovalResolved,
    ApprovalExpired,
    ApprovalCancelled,
    ActionCancelled,
    ActionExecuted,
    ActionFailed,
    SnapshotCaptured,
    SnapshotCommitted,
    RollbackSucceeded,
    RollbackFailed,
    PolicyMutated,
    // Lifecycle
    BrokerStarted,
    Shutdown,
}

impl AuditKind {
    pub const ALL: [AuditKind; 27] = [
        Self::ProviderRegistered,
        Self::ProviderDeregistered,
        Self::ProviderDegraded,
        Self::ProviderRecovered,
        Self::ProviderUnreachable,
        Self::ProviderPurged,
        Self::PermissionCheck,
        Self::PermissionMutated,
        Self::ClearanceMutated,
        Self::ContextGathered,
        Self::ContextPushed,
        Self::ActionReceived,
        Self::DecisionRecorded,
        Self::ApprovalSubmitted,
        Self::ApprovalResolved,
        Self::ApprovalExpired,
        Self::ApprovalCancelled,
        Self::ActionCancelled,
        Self::ActionExecuted,
        Self::ActionFailed,
        Self::SnapshotCaptured,
        Self::SnapshotCommitted,
        Self::RollbackSucceeded,
        Self::RollbackFailed,
        Self::PolicyMutated,
        Self::BrokerStarted,
        Self::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderRegistered => "provider_registered",
            Self::ProviderDeregistered => "provider_deregistered",
            Self::ProviderDegraded => "provider_degraded",
            Self::ProviderRecovered => "provider_recovered",
            Self::ProviderUnreachable => "provider_unreachable",
            Self::ProviderPurged => "provider_purged",
            Self::PermissionCheck => "permission_check",
            Self::PermissionMutated => "permission_mutated",
            Self::ClearanceMutated => "clearance_mutated",
            Self::ContextGathered => "context_gathered",
            Self::ContextPushed => "context_pushed",
            Self::ActionReceived => "action_received",
            Self::DecisionRecorded => "decision_recorded",
            Self::ApprovalSubmitted => "approval_submitted",
            Self::ApprovalResolved => "approval_resolved",
            Self::ApprovalExpired => "approval_expired",
            Self::ApprovalCancelled => "approval_cancelled",
            Self::ActionCancelled => "action_cancelled",
            Self::ActionExecuted => "action_executed",
            Self::ActionFailed => "action_failed",
            Self::SnapshotCaptured => "snapshot_captured",
            Self::SnapshotCommitted => "snapshot_committed",
            Self::RollbackSucceeded => "rollback_succeeded",
            Self::RollbackFailed => "rollback_failed",
            Self::PolicyMutated => "policy_mutated",
            Self::BrokerStarted => "broker_started",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown audit kind '{s}'"))
    }
}

pub(crate) fn parse_severity(s: &str) -> Result<Severity, String> {
    match s {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "critical" => Ok(Severity::Critical),
        other => Err(format!("unknown severity '{other}'")),
    }
}

/// Canonical timestamp text. Nanosecond precision so it survives storage.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// One link of the audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Starts at 1, strictly increasing, no gaps.
    pub seq: u64,
    pub actor: String,
    pub kind: AuditKind,
    pub severity: Severity,
    pub payload: Value,
    /// blake3 of the serialized payload, hex.
    pub payload_digest: String,
    pub prev_hash: String,
    pub entry_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Build and seal a new entry on top of `prev_hash`.
    pub(crate) fn seal(
        seq: u64,
        prev_hash: String,
        actor: String,
        kind: AuditKind,
        severity: Severity,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let payload_digest = digest_payload(&payload);
        let mut entry = Self {
            seq,
            actor,
            kind,
            severity,
            payload,
            payload_digest,
            prev_hash,
            entry_hash: String::new(),
            timestamp,
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    /// Hash over `prev_hash || seq || actor || kind || severity || digest || timestamp`.
    pub fn compute_hash(&self) -> String {
        let severity = self.severity.to_string();
        let timestamp = format_timestamp(&self.timestamp);
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&self.seq.to_be_bytes());
        for field in [
            self.actor.as_str(),
            self.kind.as_str(),
            severity.as_str(),
            self.payload_digest.as_str(),
            timestamp.as_str(),
        ] {
            // Length prefix keeps field boundaries unambiguous.
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// blake3 digest of a payload's canonical JSON bytes.
pub fn digest_payload(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_string_roundtrip() {
        for kind in AuditKind::ALL {
            assert_eq!(kind.as_str().parse::<AuditKind>().unwrap(), kind);
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }

    #[test]
    fn hash_covers_payload() {
        let now = Utc::now();
        let a = AuditEntry::seal(
            1,
            GENESIS_HASH.into(),
            "shell-ui".into(),
            AuditKind::PermissionCheck,
            Severity::Info,
            json!({"allowed": true}),
            now,
        );
        let b = AuditEntry::seal(
            1,
            GENESIS_HASH.into(),
            "shell-ui".into(),
            AuditKind::PermissionCheck,
            Severity::Info,
            json!({"allowed": false}),
            now,
        );
        assert_ne!(a.entry_hash, b.entry_hash);
        assert_eq!(a.entry_hash, a.compute_hash());
    }

    #[test]
    fn timestamp_format_roundtrips() {
        let now = Utc::now();
        let text = format_timestamp(&now);
        let parsed = DateTime::parse_from_rfc3339(&text).unwrap().with_timezone(&Utc);
        assert_eq!(parsed, now);
    }
}
