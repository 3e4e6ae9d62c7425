use chrono::{DateTime, Utc};
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::PermissionsConfig;
use nexus_core::{NexusError, PermissionRule, Result, Sensitivity, Severity};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::ratelimit::SlidingWindowLimiter;

/// Reason given when a rate-limited rule's window is exhausted.
pub const RATE_LIMITED: &str = "rate_limited";

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allow {
        rule_id: String,
    },
    Deny {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
    },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Allow { rule_id } => Some(rule_id),
            Self::Deny { rule_id, .. } => rule_id.as_deref(),
        }
    }

    fn deny(reason: impl Into<String>, rule_id: Option<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            rule_id,
        }
    }
}

/// Decides whether a consumer may read a context type from a provider.
///
/// Among the rules matching the triple, only the most specific tier counts;
/// inside that tier a deny beats an allow. No matching rule means deny.
pub struct PermissionGuard {
    rules: RwLock<Vec<PermissionRule>>,
    clearances: RwLock<HashMap<String, Sensitivity>>,
    default_clearance: RwLock<Sensitivity>,
    limiter: SlidingWindowLimiter,
    audit: Arc<AuditLog>,
}

impl PermissionGuard {
    /// Build from static config. Rules are validated; loading them is not
    /// itself audited since it is not a runtime mutation.
    pub fn new(config: &PermissionsConfig, audit: Arc<AuditLog>) -> Result<Self> {
        validate_rule_set(&config.rules)?;
        Ok(Self {
            rules: RwLock::new(config.rules.clone()),
            clearances: RwLock::new(config.clearances.clone()),
            default_clearance: RwLock::new(config.default_clearance),
            limiter: SlidingWindowLimiter::new(),
            audit,
        })
    }

    pub fn check(&self, consumer: &str, provider: &str, context_type: &str) -> Result<AccessDecision> {
        self.check_at(consumer, provider, context_type, Utc::now())
    }

    /// Evaluate and audit one access at `now`.
    pub fn check_at(
        &self,
        consumer: &str,
        provider: &str,
        context_type: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision> {
        let decision = match self.limiter.blocked(consumer, provider, context_type, now) {
            Some(rule_id) => AccessDecision::deny(RATE_LIMITED, Some(rule_id)),
            None => self.evaluate(consumer, provider, context_type, now),
        };

        self.audit.append(
            consumer,
            AuditKind::PermissionCheck,
            Severity::Info,
            json!({
                "consumer": consumer,
                "provider": provider,
                "context_type": context_type,
                "allowed": decision.is_allowed(),
                "rule_id": decision.rule_id(),
                "reason": match &decision {
                    AccessDecision::Deny { reason, .. } => Some(reason.as_str()),
                    AccessDecision::Allow { .. } => None,
                },
            }),
        )?;
        debug!(consumer, provider, context_type, ?decision, "permission check");
        Ok(decision)
    }

    fn evaluate(
        &self,
        consumer: &str,
        provider: &str,
        context_type: &str,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        let rules = self.rules.read();
        let matching: Vec<&PermissionRule> = rules
            .iter()
            .filter(|r| r.matches(consumer, provider, context_type) && r.is_active_at(now))
            .collect();
        let Some(top) = matching.iter().map(|r| r.specificity()).max() else {
            return AccessDecision::deny("no matching rule", None);
        };
        let tier: Vec<&PermissionRule> = matching
            .into_iter()
            .filter(|r| r.specificity() == top)
            .collect();

        if let Some(deny) = tier.iter().find(|r| !r.allowed) {
            return AccessDecision::deny(format!("denied by rule '{}'", deny.id), Some(deny.id.clone()));
        }
        let Some(allow) = tier.first() else {
            return AccessDecision::deny("no matching rule", None);
        };

        if let Some(limit) = allow.rate_limit()
            && !self
                .limiter
                .acquire(consumer, provider, context_type, &allow.id, limit, now)
        {
            return AccessDecision::deny(RATE_LIMITED, Some(allow.id.clone()));
        }
        AccessDecision::Allow {
            rule_id: allow.id.clone(),
        }
    }

    // ── Admin mutations (all audited) ──────────────────────────

    pub fn add_rule(&self, actor: &str, rule: PermissionRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(NexusError::ConfigValidation {
                field: format!("permissions.rules.{}", rule.id),
                reason: "duplicate rule id".into(),
            });
        }
        self.audit.append(
            actor,
            AuditKind::PermissionMutated,
            Severity::Warning,
            json!({ "op": "add", "rule": rule }),
        )?;
        info!(actor, rule = %rule.id, "permission rule added");
        rules.push(rule);
        Ok(())
    }

    pub fn remove_rule(&self, actor: &str, rule_id: &str) -> Result<PermissionRule> {
        let mut rules = self.rules.write();
        let Some(pos) = rules.iter().position(|r| r.id == rule_id) else {
            return Err(NexusError::ConfigValidation {
                field: format!("permissions.rules.{rule_id}"),
                reason: "no such rule".into(),
            });
        };
        self.audit.append(
            actor,
            AuditKind::PermissionMutated,
            Severity::Warning,
            json!({ "op": "remove", "rule": rules[pos] }),
        )?;
        info!(actor, rule = %rule_id, "permission rule removed");
        Ok(rules.remove(pos))
    }

    /// Swap the whole rule set, e.g. after a config reload. Open rate
    /// windows are reset.
    pub fn replace_rules(&self, actor: &str, new_rules: Vec<PermissionRule>) -> Result<()> {
        validate_rule_set(&new_rules)?;
        let mut rules = self.rules.write();
        if *rules == new_rules {
            return Ok(());
        }
        self.audit.append(
            actor,
            AuditKind::PermissionMutated,
            Severity::Warning,
            json!({
                "op": "replace",
                "previous": rules.iter().map(|r| &r.id).collect::<Vec<_>>(),
                "rules": new_rules,
            }),
        )?;
        info!(actor, count = new_rules.len(), "permission rules replaced");
        *rules = new_rules;
        self.limiter.clear();
        Ok(())
    }

    pub fn rules(&self) -> Vec<PermissionRule> {
        self.rules.read().clone()
    }

    pub fn set_clearance(&self, actor: &str, consumer: &str, level: Sensitivity) -> Result<()> {
        let mut clearances = self.clearances.write();
        if clearances.get(consumer) == Some(&level) {
            return Ok(());
        }
        self.audit.append(
            actor,
            AuditKind::ClearanceMutated,
            Severity::Warning,
            json!({
                "consumer": consumer,
                "previous": clearances.get(consumer),
                "clearance": level,
            }),
        )?;
        info!(actor, consumer, %level, "clearance changed");
        clearances.insert(consumer.to_string(), level);
        Ok(())
    }

    pub fn set_default_clearance(&self, actor: &str, level: Sensitivity) -> Result<()> {
        let mut current = self.default_clearance.write();
        if *current == level {
            return Ok(());
        }
        self.audit.append(
            actor,
            AuditKind::ClearanceMutated,
            Severity::Warning,
            json!({ "consumer": "*", "previous": *current, "clearance": level }),
        )?;
        *current = level;
        Ok(())
    }

    /// Highest sensitivity `consumer` may read.
    pub fn clearance(&self, consumer: &str) -> Sensitivity {
        self.clearances
            .read()
            .get(consumer)
            .copied()
            .unwrap_or(*self.default_clearance.read())
    }

    /// Drop idle rate windows.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        self.limiter.cleanup(now)
    }
}

fn validate_rule_set(rules: &[PermissionRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.id.as_str()) {
            return Err(NexusError::ConfigValidation {
                field: format!("permissions.rules.{}", rule.id),
                reason: "duplicate rule id".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::WILDCARD;

    fn guard(rules: Vec<PermissionRule>) -> PermissionGuard {
        let config = PermissionsConfig {
            rules,
            ..Default::default()
        };
        PermissionGuard::new(&config, Arc::new(AuditLog::new(1000))).unwrap()
    }

    #[test]
    fn default_deny() {
        let g = guard(vec![]);
        let d = g.check("ui", "fs", "filesystem").unwrap();
        assert_eq!(d, AccessDecision::deny("no matching rule", None));
    }

    #[test]
    fn specific_allow_beats_wildcard_deny() {
        let g = guard(vec![
            PermissionRule::deny("deny-all", "ui", WILDCARD, WILDCARD),
            PermissionRule::allow("fs-ok", "ui", "fs", "filesystem"),
        ]);
        assert!(g.check("ui", "fs", "filesystem").unwrap().is_allowed());
        assert!(!g.check("ui", "net", "network").unwrap().is_allowed());
    }

    #[test]
    fn deny_wins_within_same_tier() {
        let g = guard(vec![
            PermissionRule::allow("a", "ui", "fs", WILDCARD),
            PermissionRule::deny("d", "ui", "fs", WILDCARD),
        ]);
        let d = g.check("ui", "fs", "filesystem").unwrap();
        assert_eq!(d.rule_id(), Some("d"));
        assert!(!d.is_allowed());
    }

    #[test]
    fn duplicate_ids_rejected_at_construction() {
        let config = PermissionsConfig {
            rules: vec![
                PermissionRule::allow("a", "ui", "fs", WILDCARD),
                PermissionRule::deny("a", "ui", "net", WILDCARD),
            ],
            ..Default::default()
        };
        assert!(PermissionGuard::new(&config, Arc::new(AuditLog::new(10))).is_err());
    }
}
