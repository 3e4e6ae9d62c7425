use chrono::{DateTime, Utc};
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::{ApprovalConfig, TimeoutPolicy};
use nexus_core::{
    Decision, DecisionOutcome, Event, EventBus, NexusError, PendingId, ProposedAction, Resolution,
    Result, Reversibility, Severity, add_span, span_secs,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity recorded when nobody answered in time.
pub const SYSTEM_APPROVER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    /// `allowed` records what the timeout policy decided.
    Expired { allowed: bool },
    Cancelled,
}

/// An action parked until a human answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: PendingId,
    pub action: ProposedAction,
    pub decision: Decision,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
}

/// A pending approval that ran out of time.
#[derive(Debug, Clone)]
pub struct ExpiredApproval {
    pub approval: PendingApproval,
    pub allowed: bool,
}

/// Human-in-the-loop queue. Nothing waits on it: entries sit here until
/// [`resolve`](Self::resolve), [`cancel`](Self::cancel) or
/// [`expire_due`](Self::expire_due) takes them out.
pub struct ApprovalGateway {
    pending: Mutex<HashMap<PendingId, PendingApproval>>,
    config: RwLock<ApprovalConfig>,
    audit: Arc<AuditLog>,
    events: EventBus,
}

impl ApprovalGateway {
    pub fn new(config: ApprovalConfig, audit: Arc<AuditLog>, events: EventBus) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            config: RwLock::new(config),
            audit,
            events,
        }
    }

    pub fn update_config(&self, config: ApprovalConfig) {
        *self.config.write() = config;
    }

    pub fn submit(&self, action: ProposedAction, decision: Decision) -> Result<PendingId> {
        self.submit_at(action, decision, Utc::now())
    }

    pub fn submit_at(
        &self,
        action: ProposedAction,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<PendingId> {
        if decision.outcome != DecisionOutcome::ApprovalRequired || decision.action_id != action.id {
            return Err(NexusError::InvalidAction(format!(
                "action {} does not carry an approval-required decision",
                action.id
            )));
        }
        let timeout = span_secs(self.config.read().timeout_secs);
        let approval = PendingApproval {
            id: Uuid::new_v4(),
            submitted_at: now,
            expires_at: add_span(now, timeout),
            state: ApprovalState::Pending,
            approver: None,
            action,
            decision,
        };
        let reasons = approval.decision.reason_strings();

        let mut pending = self.pending.lock();
        self.audit.append(
            &approval.action.consumer,
            AuditKind::ApprovalSubmitted,
            Severity::Info,
            json!({
                "pending_id": approval.id,
                "action_id": approval.action.id,
                "risk_score": approval.decision.risk_score,
                "reasons": reasons,
                "expires_at": approval.expires_at,
            }),
        )?;
        info!(
            pending_id = %approval.id,
            action_id = %approval.action.id,
            risk = approval.decision.risk_score,
            "awaiting approval"
        );
        let id = approval.id;
        let action_id = approval.action.id;
        pending.insert(id, approval);
        drop(pending);

        self.events.publish(Event::ApprovalRequested {
            pending_id: id,
            action_id,
            reasons,
        });
        Ok(id)
    }

    /// Answer a pending approval. Fails with `ApprovalNotFound` if it was
    /// already resolved, cancelled or expired.
    pub fn resolve(
        &self,
        pending_id: PendingId,
        resolution: Resolution,
        approver: &str,
    ) -> Result<PendingApproval> {
        if approver.trim().is_empty() {
            return Err(NexusError::InvalidAction("approver is empty".into()));
        }
        let mut pending = self.pending.lock();
        let Some(approval) = pending.get(&pending_id) else {
            return Err(NexusError::ApprovalNotFound(pending_id));
        };
        self.audit.append(
            approver,
            AuditKind::ApprovalResolved,
            Severity::Info,
            json!({
                "pending_id": pending_id,
                "action_id": approval.action.id,
                "resolution": resolution,
                "approver": approver,
            }),
        )?;
        let Some(mut approval) = pending.remove(&pending_id) else {
            return Err(NexusError::ApprovalNotFound(pending_id));
        };
        drop(pending);

        approval.state = match resolution {
            Resolution::Approved => ApprovalState::Approved,
            Resolution::Rejected => ApprovalState::Rejected,
        };
        approval.approver = Some(approver.to_string());
        info!(%pending_id, action_id = %approval.action.id, ?resolution, approver, "approval resolved");
        self.events.publish(Event::ApprovalResolved {
            pending_id,
            action_id: approval.action.id,
            resolution,
            approver: approver.to_string(),
        });
        Ok(approval)
    }

    /// Withdraw a pending approval on the caller's behalf.
    pub fn cancel(&self, pending_id: PendingId, actor: &str) -> Result<PendingApproval> {
        let mut pending = self.pending.lock();
        let Some(approval) = pending.get(&pending_id) else {
            return Err(NexusError::ApprovalNotFound(pending_id));
        };
        self.audit.append(
            actor,
            AuditKind::ApprovalCancelled,
            Severity::Info,
            json!({ "pending_id": pending_id, "action_id": approval.action.id }),
        )?;
        let Some(mut approval) = pending.remove(&pending_id) else {
            return Err(NexusError::ApprovalNotFound(pending_id));
        };
        approval.state = ApprovalState::Cancelled;
        approval.approver = Some(actor.to_string());
        Ok(approval)
    }

    /// Expire every approval whose deadline has passed. Allow-by-timeout
    /// only applies to low-risk actions that are not irreversible.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredApproval>> {
        let config = self.config.read().clone();
        let mut pending = self.pending.lock();
        let mut due: Vec<PendingId> = pending
            .values()
            .filter(|a| a.expires_at <= now)
            .map(|a| a.id)
            .collect();
        due.sort_by_key(|id| pending.get(id).map(|a| a.submitted_at));

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            let Some(approval) = pending.get(&id) else {
                continue;
            };
            let allowed = config.timeout_policy == TimeoutPolicy::Allow
                && approval.decision.risk_score < config.allow_on_timeout_max_risk
                && approval.action.reversibility != Reversibility::Irreversible;
            self.audit.append(
                SYSTEM_APPROVER,
                AuditKind::ApprovalExpired,
                Severity::Warning,
                json!({
                    "pending_id": id,
                    "action_id": approval.action.id,
                    "approver": SYSTEM_APPROVER,
                    "allowed": allowed,
                    "policy": config.timeout_policy,
                }),
            )?;
            let Some(mut approval) = pending.remove(&id) else {
                continue;
            };
            approval.state = ApprovalState::Expired { allowed };
            approval.approver = Some(SYSTEM_APPROVER.to_string());
            warn!(pending_id = %id, action_id = %approval.action.id, allowed, "approval expired");
            expired.push(ExpiredApproval { approval, allowed });
        }
        drop(pending);

        for e in &expired {
            self.events.publish(Event::ApprovalExpired {
                pending_id: e.approval.id,
                action_id: e.approval.action.id,
                allowed: e.allowed,
            });
        }
        Ok(expired)
    }

    /// Everything still waiting, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut out: Vec<_> = self.pending.lock().values().cloned().collect();
        out.sort_by_key(|a| a.submitted_at);
        out
    }

    pub fn get(&self, pending_id: PendingId) -> Option<PendingApproval> {
        self.pending.lock().get(&pending_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
