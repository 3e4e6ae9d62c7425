//! Deterministic risk scoring for proposed actions.
//!
//! risk = impact weight
//!      + partial-reversibility penalty
//!      + deny / flag keyword weights (matched against kind and target)
//!      + sensitive context weight (capped)
//!      + per-consumer adjustment
//!
//! clamped to `[0, 1]`, then floored for irreversible actions. The bands
//! come from `SafetyConfig`; consumer overrides may force approval or block
//! outright. Every factor that fires is recorded as a [`RiskFactor`].

use chrono::Utc;
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::SafetyConfig;
use nexus_core::{
    ContextRecord, Decision, DecisionOutcome, PolicyOverride, ProposedAction, Result,
    Reversibility, RiskFactor, Sensitivity, Severity,
};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_ADJUSTMENT: f64 = 0.5;

pub struct SafetyValidator {
    config: RwLock<SafetyConfig>,
    audit: Arc<AuditLog>,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            config: RwLock::new(config),
            audit,
        }
    }

    /// Score `action` against the context gathered for it.
    pub fn assess(&self, action: &ProposedAction, context: &[ContextRecord]) -> Decision {
        let config = self.config.read();
        let mut reasons = Vec::new();

        let impact = config.impact_weights.weight(action.impact);
        reasons.push(RiskFactor::Impact {
            tier: action.impact,
            weight: impact,
        });
        let mut risk = impact;

        if action.reversibility == Reversibility::PartiallyReversible {
            let weight = config.partial_reversibility_penalty;
            risk += weight;
            reasons.push(RiskFactor::PartiallyReversible { weight });
        }

        let haystack = format!("{} {}", action.kind, action.target).to_lowercase();
        for keyword in &config.deny_keywords {
            if !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()) {
                risk += config.deny_keyword_weight;
                reasons.push(RiskFactor::DenyKeyword {
                    keyword: keyword.clone(),
                    weight: config.deny_keyword_weight,
                });
            }
        }
        for keyword in &config.flag_keywords {
            if !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()) {
                risk += config.flag_keyword_weight;
                reasons.push(RiskFactor::FlagKeyword {
                    keyword: keyword.clone(),
                    weight: config.flag_keyword_weight,
                });
            }
        }

        let sensitive = context
            .iter()
            .filter(|r| r.sensitivity == Sensitivity::Sensitive)
            .count();
        if sensitive > 0 {
            let weight = (sensitive as f64 * config.sensitive_context_weight)
                .min(config.sensitive_context_cap);
            if weight > 0.0 {
                risk += weight;
                reasons.push(RiskFactor::SensitiveContext {
                    records: sensitive,
                    weight,
                });
            }
        }

        let policy = config.overrides.get(&action.consumer);
        if let Some(p) = policy
            && p.risk_adjustment != 0.0
        {
            let adjustment = p.risk_adjustment.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT);
            risk += adjustment;
            reasons.push(RiskFactor::ConsumerAdjustment {
                consumer: action.consumer.clone(),
                adjustment,
            });
        }

        let mut risk = risk.clamp(0.0, 1.0);
        let irreversible = action.reversibility == Reversibility::Irreversible;
        if irreversible && risk < config.irreversible_floor {
            risk = config.irreversible_floor;
            reasons.push(RiskFactor::IrreversibleFloor {
                floor: config.irreversible_floor,
            });
        }

        let mut outcome = if risk >= config.block_at_or_above {
            DecisionOutcome::Blocked
        } else if risk < config.auto_approve_below {
            DecisionOutcome::AutoApproved
        } else {
            DecisionOutcome::ApprovalRequired
        };

        if policy.is_some_and(|p| p.block_all) {
            outcome = DecisionOutcome::Blocked;
            reasons.push(RiskFactor::ConsumerBlocked {
                consumer: action.consumer.clone(),
            });
        }
        if outcome == DecisionOutcome::AutoApproved && irreversible {
            outcome = DecisionOutcome::ApprovalRequired;
            reasons.push(RiskFactor::IrreversibleNeverAuto);
        }
        if outcome == DecisionOutcome::AutoApproved && policy.is_some_and(|p| p.force_approval) {
            outcome = DecisionOutcome::ApprovalRequired;
            reasons.push(RiskFactor::ConsumerForcedApproval {
                consumer: action.consumer.clone(),
            });
        }

        debug!(action_id = %action.id, risk, %outcome, factors = reasons.len(), "action assessed");
        Decision {
            action_id: action.id,
            correlation_id: action.correlation_id(),
            outcome,
            risk_score: risk,
            reasons,
            decided_at: Utc::now(),
        }
    }

    // ── Admin mutations (all audited) ──────────────────────────

    pub fn set_override(&self, actor: &str, consumer: &str, policy: PolicyOverride) -> Result<()> {
        let mut config = self.config.write();
        self.audit.append(
            actor,
            AuditKind::PolicyMutated,
            Severity::Warning,
            json!({
                "op": "set_override",
                "consumer": consumer,
                "previous": config.overrides.get(consumer),
                "override": policy,
            }),
        )?;
        info!(actor, consumer, "safety override set");
        config.overrides.insert(consumer.to_string(), policy);
        Ok(())
    }

    pub fn clear_override(&self, actor: &str, consumer: &str) -> Result<Option<PolicyOverride>> {
        let mut config = self.config.write();
        if !config.overrides.contains_key(consumer) {
            return Ok(None);
        }
        self.audit.append(
            actor,
            AuditKind::PolicyMutated,
            Severity::Warning,
            json!({
                "op": "clear_override",
                "consumer": consumer,
                "previous": config.overrides.get(consumer),
            }),
        )?;
        info!(actor, consumer, "safety override cleared");
        Ok(config.overrides.remove(consumer))
    }

    /// Swap in a whole new policy, e.g. after a config reload.
    pub fn update_config(&self, actor: &str, new: SafetyConfig) -> Result<()> {
        let mut config = self.config.write();
        self.audit.append(
            actor,
            AuditKind::PolicyMutated,
            Severity::Warning,
            json!({
                "op": "replace",
                "auto_approve_below": new.auto_approve_below,
                "block_at_or_above": new.block_at_or_above,
                "irreversible_floor": new.irreversible_floor,
                "deny_keywords": new.deny_keywords,
                "flag_keywords": new.flag_keywords,
                "overrides": new.overrides.len(),
            }),
        )?;
        info!(actor, "safety policy replaced");
        *config = new;
        Ok(())
    }

    pub fn config(&self) -> SafetyConfig {
        self.config.read().clone()
    }
}
