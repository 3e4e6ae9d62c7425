//! Pre-action state snapshots and their reversal.
//!
//! A snapshot is captured before an action runs and sealed with a digest
//! of the state the action left behind. Rolling back restores the captured
//! state through the action's executor, but only while the snapshot is
//! still inside its retention window and the target still looks the way
//! the action left it.

use chrono::{DateTime, Utc};
use nexus_audit::entry::digest_payload;
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::RollbackConfig;
use nexus_core::{
    ActionExecutor, ActionId, NexusError, ProposedAction, Result, RollbackOutcome, Severity,
    SnapshotId, add_span, span_secs,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const SNAPSHOT_EXPIRED: &str = "snapshot_expired";
pub const STATE_DIVERGED: &str = "state_diverged";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Captured, usable for rollback.
    Open,
    /// Confirmed unneeded; state dropped.
    Committed,
    /// Retention window passed; state dropped.
    Expired,
    RolledBack,
}

impl SnapshotStatus {
    fn is_final(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub action_id: ActionId,
    pub target: String,
    /// Captured pre-action state. Dropped once the snapshot is committed or expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    pub state_digest: String,
    /// Digest of the state the action produced, set by [`RollbackManager::seal`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_state_digest: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

pub struct RollbackManager {
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    config: RwLock<RollbackConfig>,
    audit: Arc<AuditLog>,
}

impl RollbackManager {
    pub fn new(config: RollbackConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            audit,
        }
    }

    pub fn update_config(&self, config: RollbackConfig) {
        *self.config.write() = config;
    }

    /// Store the pre-action state of `action`. Irreversible actions never
    /// get a snapshot.
    pub fn snapshot(&self, action: &ProposedAction, state: Value) -> Result<SnapshotId> {
        if !action.reversibility.needs_snapshot() {
            return Err(NexusError::IrreversibleRollback(action.id));
        }
        let now = Utc::now();
        let retention = span_secs(self.config.read().retention_secs);
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            action_id: action.id,
            target: action.target.clone(),
            state_digest: digest_payload(&state),
            state: Some(state),
            post_state_digest: None,
            captured_at: now,
            expires_at: add_span(now, retention),
            status: SnapshotStatus::Open,
            finalized_at: None,
        };

        self.audit.append(
            &action.consumer,
            AuditKind::SnapshotCaptured,
            Severity::Info,
            json!({
                "snapshot_id": snapshot.id,
                "action_id": action.id,
                "target": action.target,
                "state_digest": snapshot.state_digest,
                "expires_at": snapshot.expires_at,
            }),
        )?;
        debug!(snapshot_id = %snapshot.id, action_id = %action.id, "snapshot captured");
        let id = snapshot.id;
        self.snapshots.write().insert(id, snapshot);
        Ok(id)
    }

    /// Record what the target looked like right after the action ran.
    pub fn seal(&self, snapshot_id: SnapshotId, post_state: &Value) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .get_mut(&snapshot_id)
            .ok_or(NexusError::SnapshotNotFound(snapshot_id))?;
        snapshot.post_state_digest = Some(digest_payload(post_state));
        Ok(())
    }

    /// Mark a snapshot as no longer needed. Its state is dropped.
    pub fn commit(&self, actor: &str, snapshot_id: SnapshotId) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let snapshot = snapshots
            .get_mut(&snapshot_id)
            .ok_or(NexusError::SnapshotNotFound(snapshot_id))?;
        if snapshot.status.is_final() {
            return Ok(());
        }
        self.audit.append(
            actor,
            AuditKind::SnapshotCommitted,
            Severity::Info,
            json!({
                "snapshot_id": snapshot_id,
                "action_id": snapshot.action_id,
                "reason": "confirmed",
            }),
        )?;
        snapshot.status = SnapshotStatus::Committed;
        snapshot.state = None;
        snapshot.finalized_at = Some(Utc::now());
        Ok(())
    }

    /// Expire every open snapshot whose retention window has passed.
    pub fn commit_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut snapshots = self.snapshots.write();
        let mut expired = 0;
        for snapshot in snapshots.values_mut() {
            if snapshot.status != SnapshotStatus::Open || snapshot.expires_at > now {
                continue;
            }
            self.audit.append(
                "rollback",
                AuditKind::SnapshotCommitted,
                Severity::Info,
                json!({
                    "snapshot_id": snapshot.id,
                    "action_id": snapshot.action_id,
                    "reason": "retention_elapsed",
                }),
            )?;
            snapshot.status = SnapshotStatus::Expired;
            snapshot.state = None;
            snapshot.finalized_at = Some(now);
            expired += 1;
        }
        if expired > 0 {
            debug!(expired, "snapshots expired");
        }
        Ok(expired)
    }

    /// Forget finalized snapshots older than the tombstone window.
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let keep = span_secs(self.config.read().tombstone_secs);
        let mut snapshots = self.snapshots.write();
        let before = snapshots.len();
        snapshots.retain(|_, s| match s.finalized_at {
            Some(at) if s.status.is_final() => now - at < keep,
            _ => true,
        });
        before - snapshots.len()
    }

    pub fn get(&self, snapshot_id: SnapshotId) -> Option<Snapshot> {
        self.snapshots.read().get(&snapshot_id).cloned()
    }

    pub fn snapshot_for(&self, action_id: ActionId) -> Option<Snapshot> {
        self.snapshots
            .read()
            .values()
            .find(|s| s.action_id == action_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn rollback(
        &self,
        snapshot_id: SnapshotId,
        action: &ProposedAction,
        executor: &dyn ActionExecutor,
    ) -> Result<RollbackOutcome> {
        self.rollback_at(snapshot_id, action, executor, Utc::now()).await
    }

    /// Restore the captured state. Refusals and restore errors come back as
    /// [`RollbackOutcome::Failed`] and are audited as critical.
    pub async fn rollback_at(
        &self,
        snapshot_id: SnapshotId,
        action: &ProposedAction,
        executor: &dyn ActionExecutor,
        now: DateTime<Utc>,
    ) -> Result<RollbackOutcome> {
        enum Plan {
            Noop,
            Refuse(&'static str),
            Restore(Value, Option<String>),
        }
        let plan = {
            let snapshots = self.snapshots.read();
            let snapshot = snapshots
                .get(&snapshot_id)
                .ok_or(NexusError::SnapshotNotFound(snapshot_id))?;
            match (snapshot.status, &snapshot.state) {
                (SnapshotStatus::RolledBack, _) => Plan::Noop,
                // A committed snapshot has given up its state like an expired one.
                (SnapshotStatus::Committed | SnapshotStatus::Expired, _)
                | (SnapshotStatus::Open, None) => Plan::Refuse(SNAPSHOT_EXPIRED),
                (SnapshotStatus::Open, Some(_)) if snapshot.expires_at <= now => {
                    Plan::Refuse(SNAPSHOT_EXPIRED)
                }
                (SnapshotStatus::Open, Some(state)) => {
                    Plan::Restore(state.clone(), snapshot.post_state_digest.clone())
                }
            }
        };
        let (state, post_digest) = match plan {
            Plan::Noop => {
                debug!(%snapshot_id, "snapshot already rolled back");
                return Ok(RollbackOutcome::RolledBack { noop: true });
            }
            Plan::Refuse(reason) => return self.fail(snapshot_id, action, reason.to_string()),
            Plan::Restore(state, post_digest) => (state, post_digest),
        };

        // Something else touched the target after the action ran.
        if let Some(expected) = post_digest {
            let current = match executor.capture_state(action).await {
                Ok(current) => current,
                Err(e) => return self.fail(snapshot_id, action, format!("restore_failed: {e}")),
            };
            if digest_payload(&current) != expected {
                return self.fail(snapshot_id, action, STATE_DIVERGED.into());
            }
        }

        if let Err(e) = executor.restore_state(action, &state).await {
            return self.fail(snapshot_id, action, format!("restore_failed: {e}"));
        }

        let mut snapshots = self.snapshots.write();
        let Some(snapshot) = snapshots.get_mut(&snapshot_id) else {
            return Err(NexusError::SnapshotNotFound(snapshot_id));
        };
        if snapshot.status == SnapshotStatus::RolledBack {
            return Ok(RollbackOutcome::RolledBack { noop: true });
        }
        self.audit.append(
            &action.consumer,
            AuditKind::RollbackSucceeded,
            Severity::Warning,
            json!({
                "snapshot_id": snapshot_id,
                "action_id": action.id,
                "target": action.target,
            }),
        )?;
        snapshot.status = SnapshotStatus::RolledBack;
        snapshot.state = None;
        snapshot.finalized_at = Some(now);
        info!(%snapshot_id, action_id = %action.id, "rolled back");
        Ok(RollbackOutcome::RolledBack { noop: false })
    }

    fn fail(
        &self,
        snapshot_id: SnapshotId,
        action: &ProposedAction,
        reason: String,
    ) -> Result<RollbackOutcome> {
        self.audit.append(
            &action.consumer,
            AuditKind::RollbackFailed,
            Severity::Critical,
            json!({
                "snapshot_id": snapshot_id,
                "action_id": action.id,
                "target": action.target,
                "reason": reason,
            }),
        )?;
        error!(%snapshot_id, action_id = %action.id, %reason, "rollback failed");
        Ok(RollbackOutcome::Failed { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::StateStoreExecutor;
    use chrono::Duration;
    use nexus_core::{ImpactTier, Reversibility};

    fn setup() -> (RollbackManager, Arc<AuditLog>, StateStoreExecutor, ProposedAction) {
        let audit = Arc::new(AuditLog::new(1000));
        let mgr = RollbackManager::new(RollbackConfig::default(), Arc::clone(&audit));
        let exec = StateStoreExecutor::new("config_change");
        exec.set("svc:web", json!({ "replicas": 2 }));
        let action = ProposedAction::new(
            "assistant",
            "config_change",
            "svc:web",
            Reversibility::Reversible,
            ImpactTier::Medium,
        )
        .with_parameters(json!({ "replicas": 4 }));
        (mgr, audit, exec, action)
    }

    #[tokio::test]
    async fn restores_and_is_idempotent() {
        let (mgr, audit, exec, action) = setup();
        let before = exec.capture_state(&action).await.unwrap();
        let id = mgr.snapshot(&action, before).unwrap();
        exec.execute(&action).await.unwrap();
        mgr.seal(id, &exec.capture_state(&action).await.unwrap()).unwrap();

        let first = mgr.rollback(id, &action, &exec).await.unwrap();
        assert_eq!(first, RollbackOutcome::RolledBack { noop: false });
        assert_eq!(exec.get("svc:web"), Some(json!({ "replicas": 2 })));

        exec.set("svc:web", json!({ "replicas": 9 }));
        let second = mgr.rollback(id, &action, &exec).await.unwrap();
        assert_eq!(second, RollbackOutcome::RolledBack { noop: true });
        assert_eq!(exec.get("svc:web"), Some(json!({ "replicas": 9 })));
        assert_eq!(audit.entries_of(AuditKind::RollbackSucceeded).len(), 1);
    }

    #[tokio::test]
    async fn diverged_state_is_refused() {
        let (mgr, audit, exec, action) = setup();
        let id = mgr.snapshot(&action, exec.capture_state(&action).await.unwrap()).unwrap();
        exec.execute(&action).await.unwrap();
        mgr.seal(id, &exec.capture_state(&action).await.unwrap()).unwrap();
        exec.set("svc:web", json!({ "replicas": 7 }));

        let outcome = mgr.rollback(id, &action, &exec).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::Failed {
                reason: STATE_DIVERGED.into()
            }
        );
        assert_eq!(exec.get("svc:web"), Some(json!({ "replicas": 7 })));
        let failed = audit.entries_of(AuditKind::RollbackFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn expired_and_committed_snapshots_fail() {
        let (mgr, _audit, exec, action) = setup();
        let id = mgr.snapshot(&action, json!({})).unwrap();
        let later = Utc::now() + Duration::hours(2);
        let outcome = mgr.rollback_at(id, &action, &exec, later).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::Failed {
                reason: SNAPSHOT_EXPIRED.into()
            }
        );

        let id = mgr.snapshot(&action, json!({})).unwrap();
        mgr.commit("assistant", id).unwrap();
        assert!(mgr.get(id).unwrap().state.is_none());
        let outcome = mgr.rollback(id, &action, &exec).await.unwrap();
        assert_eq!(
            outcome,
            RollbackOutcome::Failed {
                reason: SNAPSHOT_EXPIRED.into()
            }
        );
    }

    #[test]
    fn irreversible_actions_get_no_snapshot() {
        let (mgr, _audit, _exec, mut action) = setup();
        action.reversibility = Reversibility::Irreversible;
        assert!(matches!(
            mgr.snapshot(&action, json!({})),
            Err(NexusError::IrreversibleRollback(_))
        ));
        assert!(mgr.is_empty());
    }

    #[test]
    fn expiry_then_purge() {
        let (mgr, _audit, _exec, action) = setup();
        let id = mgr.snapshot(&action, json!({ "a": 1 })).unwrap();
        let t = Utc::now();
        assert_eq!(mgr.commit_expired(t).unwrap(), 0);
        assert_eq!(mgr.commit_expired(t + Duration::seconds(3601)).unwrap(), 1);
        assert_eq!(mgr.get(id).unwrap().status, SnapshotStatus::Expired);
        assert_eq!(mgr.purge(t + Duration::hours(2)), 0);
        assert_eq!(mgr.purge(t + Duration::days(2)), 1);
        assert!(mgr.get(id).is_none());
    }
}
