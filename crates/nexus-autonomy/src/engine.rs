//! Per-action orchestration.
//!
//! ```text
//! Received → ContextGathered → Assessed ─┬→ Executing ─┬→ Completed ─(manual)─┬→ RolledBack
//!                                        │      ↑      ├→ RolledBack          └→ Failed
//!                                        │      │      └→ Failed
//!                                        ├→ AwaitingApproval ─→ Rejected
//!                                        └→ Rejected
//! ```
//!
//! Anything before `Executing` may be cancelled. A target is locked from
//! `Executing` until the action settles, and an execution failure always
//! attempts a rollback when a snapshot exists. An internal error after
//! `Executing` (the audit log halting, say) settles the action as `Failed`.

use chrono::{DateTime, Utc};
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::EngineConfig;
use nexus_context::ContextRouter;
use nexus_core::{
    ActionExecutor, ActionFailure, ActionId, ActionReport, ActionState, ContextRecord,
    ContextRequest, Decision, DecisionOutcome, Event, EventBus, NexusError, PendingId,
    ProposedAction, Resolution, Result, RollbackOutcome, Severity, SnapshotId, StateTransition,
};
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalGateway;
use crate::locks::ResourceLocks;
use crate::rollback::RollbackManager;
use crate::safety::SafetyValidator;

struct ActionRecord {
    action: ProposedAction,
    state: ActionState,
    decision: Option<Decision>,
    pending_id: Option<PendingId>,
    snapshot_id: Option<SnapshotId>,
    result: Option<Value>,
    failure: Option<ActionFailure>,
    note: Option<String>,
    history: Vec<StateTransition>,
}

impl ActionRecord {
    fn new(action: ProposedAction) -> Self {
        Self {
            action,
            state: ActionState::Received,
            decision: None,
            pending_id: None,
            snapshot_id: None,
            result: None,
            failure: None,
            note: None,
            history: vec![StateTransition {
                state: ActionState::Received,
                at: Utc::now(),
            }],
        }
    }

    fn report(&self) -> ActionReport {
        ActionReport {
            action_id: self.action.id,
            consumer: self.action.consumer.clone(),
            target: self.action.target.clone(),
            state: self.state,
            decision: self.decision.clone(),
            pending_id: self.pending_id,
            snapshot_id: self.snapshot_id,
            result: self.result.clone(),
            failure: self.failure.clone(),
            note: self.note.clone(),
            history: self.history.clone(),
        }
    }
}

pub struct AutonomyEngine {
    router: Arc<ContextRouter>,
    safety: Arc<SafetyValidator>,
    rollback: Arc<RollbackManager>,
    approvals: Arc<ApprovalGateway>,
    locks: ResourceLocks,
    executors: RwLock<HashMap<String, Arc<dyn ActionExecutor>>>,
    actions: RwLock<HashMap<ActionId, ActionRecord>>,
    audit: Arc<AuditLog>,
    events: EventBus,
    config: RwLock<EngineConfig>,
}

impl AutonomyEngine {
    pub fn new(
        config: EngineConfig,
        router: Arc<ContextRouter>,
        safety: Arc<SafetyValidator>,
        rollback: Arc<RollbackManager>,
        approvals: Arc<ApprovalGateway>,
        audit: Arc<AuditLog>,
        events: EventBus,
    ) -> Self {
        Self {
            router,
            safety,
            rollback,
            approvals,
            locks: ResourceLocks::new(),
            executors: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            audit,
            events,
            config: RwLock::new(config),
        }
    }

    pub fn update_config(&self, config: EngineConfig) {
        *self.config.write() = config;
    }

    /// Install the executor for its action kind, replacing any previous one.
    pub fn register_executor(&self, executor: Arc<dyn ActionExecutor>) {
        let kind = executor.kind().to_string();
        info!(%kind, "executor registered");
        self.executors.write().insert(kind, executor);
    }

    pub fn executor_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.executors.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn executor(&self, kind: &str) -> Result<Arc<dyn ActionExecutor>> {
        self.executors
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| NexusError::ExecutorNotFound(kind.to_string()))
    }

    // ── Submission ─────────────────────────────────────────────

    /// Take a proposed action through gathering, assessment, and either
    /// execution, parking for approval, or rejection.
    pub async fn submit(&self, action: ProposedAction) -> Result<ActionReport> {
        action.validate()?;
        self.executor(&action.kind)?;
        let id = action.id;
        {
            let mut actions = self.actions.write();
            if actions.contains_key(&id) {
                return Err(NexusError::DuplicateAction(id));
            }
            self.audit.append(
                &action.consumer,
                AuditKind::ActionReceived,
                Severity::Info,
                json!({
                    "action_id": id,
                    "correlation_id": action.correlation_id(),
                    "kind": action.kind,
                    "target": action.target,
                    "reversibility": action.reversibility,
                    "impact": action.impact,
                }),
            )?;
            actions.insert(id, ActionRecord::new(action.clone()));
        }
        info!(action_id = %id, consumer = %action.consumer, kind = %action.kind, target = %action.target, "action received");

        let context = self.gather_for(&action).await?;
        if !self.transition(id, ActionState::ContextGathered)? {
            return self.report(id);
        }

        let decision = self.safety.assess(&action, &context);
        self.audit.append(
            &action.consumer,
            AuditKind::DecisionRecorded,
            match decision.outcome {
                DecisionOutcome::Blocked => Severity::Warning,
                _ => Severity::Info,
            },
            json!({
                "action_id": id,
                "correlation_id": decision.correlation_id,
                "outcome": decision.outcome,
                "risk_score": decision.risk_score,
                "reasons": decision.reason_strings(),
                "context_records": context.len(),
            }),
        )?;
        self.events.publish(Event::ActionAssessed {
            action_id: id,
            outcome: decision.outcome,
            risk_score: decision.risk_score,
        });
        self.update(id, |r| r.decision = Some(decision.clone()))?;
        if !self.transition(id, ActionState::Assessed)? {
            return self.report(id);
        }

        match decision.outcome {
            DecisionOutcome::Blocked => {
                let note = format!("blocked: {}", decision.reason_strings().join("; "));
                warn!(action_id = %id, risk = decision.risk_score, "action blocked");
                self.update(id, |r| r.note = Some(note))?;
                self.transition(id, ActionState::Rejected)?;
                self.report(id)
            }
            DecisionOutcome::ApprovalRequired => {
                if !self.transition(id, ActionState::AwaitingApproval)? {
                    return self.report(id);
                }
                let consumer = action.consumer.clone();
                let pending_id = self.approvals.submit(action, decision)?;
                let mut cancelled = false;
                self.update(id, |r| {
                    r.pending_id = Some(pending_id);
                    cancelled = r.state == ActionState::Cancelled;
                })?;
                if cancelled
                    // Cancelled before the approval was parked.
                    && let Err(e) = self.approvals.cancel(pending_id, &consumer)
                {
                    warn!(action_id = %id, %pending_id, error = %e, "could not withdraw approval of cancelled action");
                }
                self.report(id)
            }
            DecisionOutcome::AutoApproved => self.run(id).await,
        }
    }

    async fn gather_for(&self, action: &ProposedAction) -> Result<Vec<ContextRecord>> {
        let (types, limit) = {
            let config = self.config.read();
            let types = if action.context_types.is_empty() {
                config.assessment_context_types.clone()
            } else {
                action.context_types.clone()
            };
            (types, config.assessment_context_limit)
        };
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let request = ContextRequest::new(action.consumer.clone(), types).with_limit(limit);
        match self.router.gather(&request).await {
            Ok(response) => Ok(response.records),
            Err(e @ NexusError::AuditHalted(_)) => Err(e),
            Err(NexusError::NoAccessibleContext) => {
                debug!(action_id = %action.id, "no accessible context for assessment");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "context gathering failed; assessing without context");
                Ok(Vec::new())
            }
        }
    }

    // ── Approval ───────────────────────────────────────────────

    /// Apply a human answer to a parked action.
    pub async fn resolve_approval(
        &self,
        pending_id: PendingId,
        resolution: Resolution,
        approver: &str,
    ) -> Result<ActionReport> {
        let approval = self.approvals.resolve(pending_id, resolution, approver)?;
        let id = approval.action.id;
        match resolution {
            Resolution::Approved => self.run(id).await,
            Resolution::Rejected => {
                self.update(id, |r| r.note = Some(format!("rejected by {approver}")))?;
                self.transition(id, ActionState::Rejected)?;
                self.report(id)
            }
        }
    }

    /// Settle every approval that timed out. Each one is settled on its own:
    /// an error on one is logged and leaves that action terminal, and the
    /// rest are still processed.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Result<Vec<ActionReport>> {
        let expired = self.approvals.expire_due(now)?;
        let mut reports = Vec::with_capacity(expired.len());
        for e in expired {
            let id = e.approval.action.id;
            match self.settle_expired(id, e.allowed).await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(action_id = %id, error = %err, "could not settle expired approval");
                    self.abandon(id, format!("approval expiry failed: {err}"));
                    if let Ok(report) = self.report(id) {
                        reports.push(report);
                    }
                }
            }
        }
        Ok(reports)
    }

    async fn settle_expired(&self, id: ActionId, allowed: bool) -> Result<ActionReport> {
        if allowed {
            return self.run(id).await;
        }
        self.update(id, |r| r.note = Some("approval timed out".into()))?;
        self.transition(id, ActionState::Rejected)?;
        self.report(id)
    }

    // ── Cancellation ───────────────────────────────────────────

    pub fn cancel(&self, action_id: ActionId, actor: &str) -> Result<ActionReport> {
        let (state, pending_id, consumer) = {
            let actions = self.actions.read();
            let record = actions
                .get(&action_id)
                .ok_or(NexusError::ActionNotFound(action_id))?;
            (record.state, record.pending_id, record.action.consumer.clone())
        };
        if !state.is_cancellable() {
            return Err(NexusError::NotCancellable {
                action_id,
                state: state.to_string(),
            });
        }
        if state == ActionState::AwaitingApproval
            && let Some(pending_id) = pending_id
        {
            // Losing this race means the approval is being resolved right now.
            self.approvals
                .cancel(pending_id, actor)
                .map_err(|e| match e {
                    NexusError::ApprovalNotFound(_) => NexusError::NotCancellable {
                        action_id,
                        state: state.to_string(),
                    },
                    other => other,
                })?;
        }

        {
            let mut actions = self.actions.write();
            let record = actions
                .get_mut(&action_id)
                .ok_or(NexusError::ActionNotFound(action_id))?;
            if !record.state.can_transition_to(ActionState::Cancelled) {
                return Err(NexusError::NotCancellable {
                    action_id,
                    state: record.state.to_string(),
                });
            }
            self.audit.append(
                actor,
                AuditKind::ActionCancelled,
                Severity::Info,
                json!({
                    "action_id": action_id,
                    "consumer": consumer,
                    "state": record.state,
                }),
            )?;
            record.state = ActionState::Cancelled;
            record.note = Some(format!("cancelled by {actor}"));
            record.history.push(StateTransition {
                state: ActionState::Cancelled,
                at: Utc::now(),
            });
        }
        info!(%action_id, actor, "action cancelled");
        self.events.publish(Event::ActionStateChanged {
            action_id,
            state: ActionState::Cancelled,
        });
        self.report(action_id)
    }

    // ── Execution ──────────────────────────────────────────────

    async fn run(&self, id: ActionId) -> Result<ActionReport> {
        let action = self.action(id)?;
        let (lock_timeout, exec_timeout) = {
            let config = self.config.read();
            (
                Duration::from_millis(config.lock_timeout_ms),
                Duration::from_secs(config.execution_timeout_secs),
            )
        };
        let executor = match self.executor(&action.kind) {
            Ok(executor) => executor,
            Err(e) => return self.refuse(id, e.to_string()),
        };
        let _guard = match self.locks.acquire(&action.target, lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => return self.refuse(id, e.to_string()),
        };
        if !self.transition(id, ActionState::Executing)? {
            return self.report(id);
        }

        // Past this point an error must not leave the action in `Executing`.
        match self.execute(&action, executor, exec_timeout).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abandon(id, format!("internal error during execution: {e}"));
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        action: &ProposedAction,
        executor: Arc<dyn ActionExecutor>,
        exec_timeout: Duration,
    ) -> Result<ActionReport> {
        let id = action.id;
        let snapshot_id = if action.reversibility.needs_snapshot() {
            let captured = tokio::time::timeout(exec_timeout, executor.capture_state(action)).await;
            let state = match captured {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    let reason = format!("capture_state failed: {e}");
                    return self.settle_failure(action, reason, None).await;
                }
                Err(_) => {
                    let reason = format!("capture_state timed out after {}s", exec_timeout.as_secs());
                    return self.settle_failure(action, reason, None).await;
                }
            };
            let snapshot_id = match self.rollback.snapshot(action, state) {
                Ok(snapshot_id) => snapshot_id,
                Err(e) => {
                    let reason = format!("snapshot failed: {e}");
                    return self.settle_failure(action, reason, None).await;
                }
            };
            self.update(id, |r| r.snapshot_id = Some(snapshot_id))?;
            Some(snapshot_id)
        } else {
            None
        };

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(exec_timeout, executor.execute(action)).await;
        let reason = match outcome {
            Ok(Ok(result)) => {
                if let Some(snapshot_id) = snapshot_id {
                    let sealed = executor
                        .capture_state(action)
                        .await
                        .and_then(|post| self.rollback.seal(snapshot_id, &post));
                    if let Err(e) = sealed {
                        warn!(action_id = %id, error = %e, "could not seal snapshot; left unsealed");
                    }
                }
                self.update(id, |r| r.result = Some(result))?;
                self.audit.append(
                    &action.consumer,
                    AuditKind::ActionExecuted,
                    Severity::Info,
                    json!({
                        "action_id": id,
                        "kind": action.kind,
                        "target": action.target,
                        "snapshot_id": snapshot_id,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                )?;
                self.transition(id, ActionState::Completed)?;
                info!(action_id = %id, target = %action.target, "action completed");
                return self.report(id);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("execution timed out after {}s", exec_timeout.as_secs()),
        };
        self.settle_failure(action, reason, snapshot_id.map(|s| (s, executor)))
            .await
    }

    /// Record an execution failure and, if possible, undo it.
    async fn settle_failure(
        &self,
        action: &ProposedAction,
        reason: String,
        snapshot: Option<(SnapshotId, Arc<dyn ActionExecutor>)>,
    ) -> Result<ActionReport> {
        let id = action.id;
        warn!(action_id = %id, %reason, "action failed");
        // The failure is recorded on the action even when the log refuses it.
        if let Err(e) = self.audit.append(
            &action.consumer,
            AuditKind::ActionFailed,
            Severity::Warning,
            json!({
                "action_id": id,
                "target": action.target,
                "reason": reason,
                "rollback_attempted": snapshot.is_some(),
            }),
        ) {
            error!(action_id = %id, error = %e, "could not audit action failure");
        }

        let Some((snapshot_id, executor)) = snapshot else {
            self.update(id, |r| r.failure = Some(ActionFailure::Execution { reason }))?;
            self.transition(id, ActionState::Failed)?;
            return self.report(id);
        };

        match self.rollback.rollback(snapshot_id, action, executor.as_ref()).await? {
            RollbackOutcome::RolledBack { .. } => {
                self.update(id, |r| r.failure = Some(ActionFailure::Execution { reason }))?;
                self.transition(id, ActionState::RolledBack)?;
            }
            RollbackOutcome::Failed {
                reason: rollback_reason,
            } => {
                error!(action_id = %id, %rollback_reason, "automatic rollback failed");
                self.events.publish(Event::RollbackFailed {
                    action_id: id,
                    reason: rollback_reason.clone(),
                });
                self.update(id, |r| {
                    r.failure = Some(ActionFailure::Rollback {
                        execution_reason: reason,
                        rollback_reason,
                    })
                })?;
                self.transition(id, ActionState::Failed)?;
            }
        }
        self.report(id)
    }

    /// Turn an approved action away before it executes.
    fn refuse(&self, id: ActionId, note: String) -> Result<ActionReport> {
        warn!(action_id = %id, %note, "action refused before execution");
        self.update(id, |r| r.note = Some(note))?;
        self.transition(id, ActionState::Rejected)?;
        self.report(id)
    }

    /// Force an action that hit an internal error into a terminal state:
    /// `Failed` once it reached `Executing`, `Rejected` before that.
    fn abandon(&self, id: ActionId, reason: String) {
        let (settled, target) = {
            let mut actions = self.actions.write();
            let Some(record) = actions.get_mut(&id) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            let settled = if record.state == ActionState::Executing {
                record.failure = Some(ActionFailure::Execution {
                    reason: reason.clone(),
                });
                ActionState::Failed
            } else {
                ActionState::Rejected
            };
            record.state = settled;
            record.note = Some(reason.clone());
            record.history.push(StateTransition {
                state: settled,
                at: Utc::now(),
            });
            (settled, record.action.target.clone())
        };
        error!(action_id = %id, state = %settled, %reason, "action abandoned");
        if let Err(e) = self.audit.append(
            "engine",
            AuditKind::ActionFailed,
            Severity::Critical,
            json!({
                "action_id": id,
                "target": target,
                "reason": reason,
                "state": settled,
            }),
        ) {
            error!(action_id = %id, error = %e, "could not audit abandoned action");
        }
        self.events.publish(Event::ActionStateChanged {
            action_id: id,
            state: settled,
        });
    }

    // ── Commit ─────────────────────────────────────────────────

    /// Confirm a completed action. Its snapshot is committed and any later
    /// rollback is refused with `snapshot_expired`.
    pub fn commit(&self, action_id: ActionId, actor: &str) -> Result<ActionReport> {
        let (state, snapshot_id) = {
            let actions = self.actions.read();
            let record = actions
                .get(&action_id)
                .ok_or(NexusError::ActionNotFound(action_id))?;
            (record.state, record.snapshot_id)
        };
        if state != ActionState::Completed {
            return Err(NexusError::InvalidTransition {
                action_id,
                from: state.to_string(),
                to: "committed".into(),
            });
        }
        // Irreversible actions never had a snapshot to give up.
        let Some(snapshot_id) = snapshot_id else {
            return self.report(action_id);
        };
        self.rollback.commit(actor, snapshot_id)?;
        info!(%action_id, %snapshot_id, actor, "action committed");
        self.update(action_id, |r| r.note = Some(format!("committed by {actor}")))?;
        self.report(action_id)
    }

    // ── Manual rollback ────────────────────────────────────────

    /// Undo a completed action. Irreversible actions are always refused.
    pub async fn rollback_action(&self, action_id: ActionId, actor: &str) -> Result<ActionReport> {
        let (action, state, snapshot_id) = {
            let actions = self.actions.read();
            let record = actions
                .get(&action_id)
                .ok_or(NexusError::ActionNotFound(action_id))?;
            (record.action.clone(), record.state, record.snapshot_id)
        };
        if !action.reversibility.needs_snapshot() {
            return Err(NexusError::IrreversibleRollback(action_id));
        }
        if !matches!(state, ActionState::Completed | ActionState::RolledBack) {
            return Err(NexusError::InvalidTransition {
                action_id,
                from: state.to_string(),
                to: ActionState::RolledBack.to_string(),
            });
        }
        let snapshot_id = snapshot_id.ok_or_else(|| NexusError::RollbackFailure {
            action_id,
            reason: "no snapshot was captured".into(),
        })?;
        let executor = self.executor(&action.kind)?;
        let lock_timeout = Duration::from_millis(self.config.read().lock_timeout_ms);
        let _guard = self.locks.acquire(&action.target, lock_timeout).await?;

        info!(%action_id, actor, "manual rollback requested");
        match self.rollback.rollback(snapshot_id, &action, executor.as_ref()).await? {
            RollbackOutcome::RolledBack { noop: true } => {}
            RollbackOutcome::RolledBack { noop: false } => {
                self.update(action_id, |r| r.note = Some(format!("rolled back by {actor}")))?;
                self.transition(action_id, ActionState::RolledBack)?;
            }
            RollbackOutcome::Failed { reason } => {
                self.events.publish(Event::RollbackFailed {
                    action_id,
                    reason: reason.clone(),
                });
                self.update(action_id, |r| {
                    r.failure = Some(ActionFailure::Rollback {
                        execution_reason: format!("rollback requested by {actor}"),
                        rollback_reason: reason,
                    })
                })?;
                self.transition(action_id, ActionState::Failed)?;
            }
        }
        self.report(action_id)
    }

    // ── Queries & bookkeeping ──────────────────────────────────

    pub fn status(&self, action_id: ActionId) -> Option<ActionReport> {
        self.actions.read().get(&action_id).map(ActionRecord::report)
    }

    /// Every tracked action, most recently received first.
    pub fn list(&self) -> Vec<ActionReport> {
        let mut out: Vec<_> = self.actions.read().values().map(ActionRecord::report).collect();
        out.sort_by(|a, b| {
            let at = |r: &ActionReport| r.history.first().map(|t| t.at);
            at(b).cmp(&at(a))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget terminal actions that settled before `before`. Completed
    /// actions whose snapshot is still open are kept for manual rollback.
    pub fn forget_settled(&self, before: DateTime<Utc>) -> usize {
        let mut actions = self.actions.write();
        let len = actions.len();
        actions.retain(|_, r| {
            let settled_at = r.history.last().map(|t| t.at).unwrap_or(before);
            let rollbackable = r.state == ActionState::Completed
                && r.snapshot_id
                    .and_then(|s| self.rollback.get(s))
                    .is_some_and(|s| s.state.is_some());
            !r.state.is_terminal() || settled_at >= before || rollbackable
        });
        len - actions.len()
    }

    pub fn cleanup_locks(&self) -> usize {
        self.locks.cleanup()
    }

    fn action(&self, id: ActionId) -> Result<ProposedAction> {
        self.actions
            .read()
            .get(&id)
            .map(|r| r.action.clone())
            .ok_or(NexusError::ActionNotFound(id))
    }

    fn report(&self, id: ActionId) -> Result<ActionReport> {
        self.status(id).ok_or(NexusError::ActionNotFound(id))
    }

    fn update(&self, id: ActionId, f: impl FnOnce(&mut ActionRecord)) -> Result<()> {
        let mut actions = self.actions.write();
        let record = actions.get_mut(&id).ok_or(NexusError::ActionNotFound(id))?;
        f(record);
        Ok(())
    }

    /// Move an action to `next`. Returns false, leaving it alone, if it was
    /// cancelled in the meantime.
    fn transition(&self, id: ActionId, next: ActionState) -> Result<bool> {
        {
            let mut actions = self.actions.write();
            let record = actions.get_mut(&id).ok_or(NexusError::ActionNotFound(id))?;
            if record.state == ActionState::Cancelled {
                debug!(action_id = %id, %next, "action was cancelled; not advancing");
                return Ok(false);
            }
            if !record.state.can_transition_to(next) {
                return Err(NexusError::InvalidTransition {
                    action_id: id,
                    from: record.state.to_string(),
                    to: next.to_string(),
                });
            }
            record.state = next;
            record.history.push(StateTransition {
                state: next,
                at: Utc::now(),
            });
        }
        debug!(action_id = %id, state = %next, "action state changed");
        self.events.publish(Event::ActionStateChanged {
            action_id: id,
            state: next,
        });
        Ok(true)
    }
}
