use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Matches any provider or any context type in a permission rule.
pub const WILDCARD: &str = "*";

/// A single access rule: may `consumer` read `context_type` from `provider`?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: String,
    pub consumer: String,
    /// Provider id or `*`.
    #[serde(default = "wildcard")]
    pub provider: String,
    /// Context type or `*`.
    #[serde(default = "wildcard")]
    pub context_type: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<RuleConditions>,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

impl PermissionRule {
    pub fn allow(
        id: impl Into<String>,
        consumer: impl Into<String>,
        provider: impl Into<String>,
        context_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            consumer: consumer.into(),
            provider: provider.into(),
            context_type: context_type.into(),
            allowed: true,
            conditions: None,
        }
    }

    pub fn deny(
        id: impl Into<String>,
        consumer: impl Into<String>,
        provider: impl Into<String>,
        context_type: impl Into<String>,
    ) -> Self {
        Self {
            allowed: false,
            ..Self::allow(id, consumer, provider, context_type)
        }
    }

    pub fn with_rate_limit(mut self, max_requests: u32, window_secs: u64) -> Self {
        self.conditions
            .get_or_insert_with(RuleConditions::default)
            .rate_limit = Some(RateLimit {
            max_requests,
            window_secs,
        });
        self
    }

    /// Whether the rule applies to the triple, ignoring conditions.
    pub fn matches(&self, consumer: &str, provider: &str, context_type: &str) -> bool {
        self.consumer == consumer
            && (self.provider == WILDCARD || self.provider == provider)
            && (self.context_type == WILDCARD || self.context_type == context_type)
    }

    /// Higher is more specific. A named provider outranks a named context
    /// type, which outranks a full wildcard.
    pub fn specificity(&self) -> u8 {
        let provider = if self.provider == WILDCARD { 0 } else { 2 };
        let context_type = if self.context_type == WILDCARD { 0 } else { 1 };
        provider + context_type
    }

    pub fn rate_limit(&self) -> Option<&RateLimit> {
        self.conditions.as_ref().and_then(|c| c.rate_limit.as_ref())
    }

    /// Whether time-based conditions let the rule apply at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.conditions
            .as_ref()
            .is_none_or(|c| c.is_active_at(now))
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |reason: String| crate::NexusError::ConfigValidation {
            field: format!("permissions.rules.{}", self.id),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(crate::NexusError::ConfigValidation {
                field: "permissions.rules".into(),
                reason: "rule id is empty".into(),
            });
        }
        if self.consumer.trim().is_empty() || self.consumer == WILDCARD {
            return Err(invalid("consumer must name a single consumer".into()));
        }
        if self.provider.trim().is_empty() || self.context_type.trim().is_empty() {
            return Err(invalid("provider and context_type must be set or '*'".into()));
        }
        if let Some(c) = &self.conditions {
            if let Some(rl) = &c.rate_limit
                && (rl.max_requests == 0 || rl.window_secs == 0)
            {
                return Err(invalid("rate limit needs max_requests > 0 and window_secs > 0".into()));
            }
            if let Some(rl) = &c.rate_limit
                && rl.window_secs > crate::MAX_SPAN_SECS
            {
                return Err(invalid(format!(
                    "rate limit window {}s exceeds the {}s maximum",
                    rl.window_secs,
                    crate::MAX_SPAN_SECS
                )));
            }
            if let Some(h) = &c.active_hours_utc
                && (h.0 > 23 || h.1 > 24 || h.0 == h.1)
            {
                return Err(invalid(format!("active_hours_utc {:?} is not a valid window", h)));
            }
        }
        Ok(())
    }
}

/// Optional limits attached to a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    pub rate_limit: Option<RateLimit>,
    /// `[start, end)` hour window in UTC. Wraps past midnight when start > end.
    pub active_hours_utc: Option<(u8, u8)>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RuleConditions {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if let Some(exp) = self.expires_at
            && now >= exp
        {
            return false;
        }
        if let Some((start, end)) = self.active_hours_utc {
            let hour = now.hour() as u8;
            let inside = if start < end {
                hour >= start && hour < end
            } else {
                hour >= start || hour < end
            };
            if !inside {
                return false;
            }
        }
        true
    }
}

/// At most `max_requests` checks per sliding `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Per-consumer adjustment applied by the safety validator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    /// Added to the computed risk before thresholds apply. Clamped to [-0.5, 0.5].
    pub risk_adjustment: f64,
    /// Never auto-approve this consumer's actions.
    pub force_approval: bool,
    /// Block every action from this consumer.
    pub block_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn specificity_orders_provider_over_type() {
        let both = PermissionRule::allow("a", "ui", "fs", "filesystem");
        let provider = PermissionRule::allow("b", "ui", "fs", WILDCARD);
        let kind = PermissionRule::allow("c", "ui", WILDCARD, "filesystem");
        let any = PermissionRule::allow("d", "ui", WILDCARD, WILDCARD);
        assert!(both.specificity() > provider.specificity());
        assert!(provider.specificity() > kind.specificity());
        assert!(kind.specificity() > any.specificity());
    }

    #[test]
    fn hour_window_wraps_midnight() {
        let c = RuleConditions {
            active_hours_utc: Some((22, 6)),
            ..Default::default()
        };
        let late = Utc.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert!(c.is_active_at(late));
        assert!(!c.is_active_at(noon));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let rule = PermissionRule::allow("r", "ui", "fs", "filesystem").with_rate_limit(0, 60);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn oversized_rate_window_is_rejected() {
        let rule =
            PermissionRule::allow("r", "ui", "fs", "filesystem").with_rate_limit(1, u64::MAX / 2);
        assert!(matches!(
            rule.validate(),
            Err(crate::NexusError::ConfigValidation { .. })
        ));
        let rule = PermissionRule::allow("r", "ui", "fs", "filesystem")
            .with_rate_limit(1, crate::MAX_SPAN_SECS);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn wildcard_consumer_is_rejected() {
        let rule = PermissionRule::allow("r", WILDCARD, "fs", "filesystem");
        assert!(rule.validate().is_err());
    }
}
