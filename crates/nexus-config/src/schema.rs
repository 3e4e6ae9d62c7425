use nexus_core::{ImpactTier, PermissionRule, PolicyOverride, Sensitivity, TrustTier};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Root configuration: maps to `nexus.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    pub registry: RegistryConfig,
    pub permissions: PermissionsConfig,
    pub router: RouterConfig,
    pub safety: SafetyConfig,
    pub rollback: RollbackConfig,
    pub approval: ApprovalConfig,
    pub engine: EngineConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

// ── Registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat intervals a provider may miss before it is marked unreachable.
    pub missed_heartbeat_threshold: u32,
    /// Seconds an unreachable provider is kept before it is purged.
    pub purge_grace_secs: u64,
    /// How often the liveness sweep runs.
    pub sweep_interval_secs: u64,
    /// Consecutive fetch failures that demote a provider to degraded.
    pub failure_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            missed_heartbeat_threshold: 3,
            purge_grace_secs: 300,
            sweep_interval_secs: 5,
            failure_threshold: 3,
        }
    }
}

// ── Permissions ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Static rule set loaded at startup.
    pub rules: Vec<PermissionRule>,
    /// Clearance for consumers without an explicit entry.
    pub default_clearance: Sensitivity,
    /// Per-consumer sensitivity clearance.
    pub clearances: HashMap<String, Sensitivity>,
    /// How often idle rate-limit windows are dropped.
    pub limiter_cleanup_secs: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_clearance: Sensitivity::Private,
            clearances: HashMap::new(),
            limiter_cleanup_secs: 60,
        }
    }
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-provider fetch timeout.
    pub provider_timeout_ms: u64,
    /// Maximum providers queried at once.
    pub max_fan_out: usize,
    /// Age at which the recency score halves.
    pub recency_half_life_secs: u64,
    pub recency_weight: f64,
    /// Bonus for a full match of the free-text query.
    pub query_match_weight: f64,
    pub trust_weights: TrustWeights,
    /// Result limit when a request asks for 0.
    pub default_limit: usize,
    /// Upper bound on any request's limit.
    pub max_limit: usize,
    /// TTL for pushed records that do not carry their own.
    pub cache_ttl_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 200,
            max_fan_out: 16,
            recency_half_life_secs: 300,
            recency_weight: 1.0,
            query_match_weight: 0.5,
            trust_weights: TrustWeights::default(),
            default_limit: 20,
            max_limit: 200,
            cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustWeights {
    pub system: f64,
    pub verified: f64,
    pub third_party: f64,
    pub untrusted: f64,
}

impl TrustWeights {
    pub fn weight(&self, tier: TrustTier) -> f64 {
        match tier {
            TrustTier::System => self.system,
            TrustTier::Verified => self.verified,
            TrustTier::ThirdParty => self.third_party,
            TrustTier::Untrusted => self.untrusted,
        }
    }
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            system: 0.3,
            verified: 0.2,
            third_party: 0.1,
            untrusted: 0.0,
        }
    }
}

// ── Safety ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Risk strictly below this is auto-approved.
    pub auto_approve_below: f64,
    /// Risk at or above this is blocked.
    pub block_at_or_above: f64,
    pub impact_weights: ImpactWeights,
    pub partial_reversibility_penalty: f64,
    /// Minimum risk of an irreversible action.
    pub irreversible_floor: f64,
    /// Substrings of kind/target that push an action toward blocking.
    pub deny_keywords: Vec<String>,
    pub deny_keyword_weight: f64,
    /// Substrings of kind/target that mark an action security-relevant.
    pub flag_keywords: Vec<String>,
    pub flag_keyword_weight: f64,
    /// Added per sensitive record in the gathered context.
    pub sensitive_context_weight: f64,
    pub sensitive_context_cap: f64,
    /// Per-consumer policy overrides.
    pub overrides: HashMap<String, PolicyOverride>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            auto_approve_below: 0.3,
            block_at_or_above: 0.7,
            impact_weights: ImpactWeights::default(),
            partial_reversibility_penalty: 0.1,
            irreversible_floor: 0.3,
            deny_keywords: ["rm -rf", "mkfs", "/etc/shadow", "drop database", "/boot"]
                .into_iter()
                .map(String::from)
                .collect(),
            deny_keyword_weight: 0.7,
            flag_keywords: ["sudo", "passwd", "ssh", "firewall", "credential", "secret", "/etc/"]
                .into_iter()
                .map(String::from)
                .collect(),
            flag_keyword_weight: 0.2,
            sensitive_context_weight: 0.05,
            sensitive_context_cap: 0.15,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl ImpactWeights {
    pub fn weight(&self, tier: ImpactTier) -> f64 {
        match tier {
            ImpactTier::Low => self.low,
            ImpactTier::Medium => self.medium,
            ImpactTier::High => self.high,
            ImpactTier::Critical => self.critical,
        }
    }
}

impl Default for ImpactWeights {
    fn default() -> Self {
        Self {
            low: 0.05,
            medium: 0.2,
            high: 0.45,
            critical: 0.75,
        }
    }
}

// ── Rollback ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// How long a snapshot stays usable after capture.
    pub retention_secs: u64,
    /// How long committed/rolled-back tombstones are kept for reporting.
    pub tombstone_secs: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            tombstone_secs: 86_400,
        }
    }
}

// ── Approval ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds a pending action waits for a human before it expires.
    pub timeout_secs: u64,
    /// What an expiry means.
    pub timeout_policy: TimeoutPolicy,
    /// Allow-by-timeout only applies below this risk.
    pub allow_on_timeout_max_risk: f64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            timeout_policy: TimeoutPolicy::Deny,
            allow_on_timeout_max_risk: 0.4,
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock limit on one executor call.
    pub execution_timeout_secs: u64,
    /// How long an action waits for its target's lock.
    pub lock_timeout_ms: u64,
    /// Context types gathered for assessment when an action names none.
    pub assessment_context_types: Vec<String>,
    pub assessment_context_limit: usize,
    /// How often expired approvals are resolved.
    pub approval_sweep_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 30,
            lock_timeout_ms: 5000,
            assessment_context_types: Vec::new(),
            assessment_context_limit: 20,
            approval_sweep_secs: 1,
        }
    }
}

// ── Audit ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite database for persisted entries (None = in-memory only).
    pub db_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
    /// How often the in-memory chain is re-verified.
    pub verify_interval_secs: u64,
    /// Entries kept in memory. Older, already-flushed entries are compacted.
    pub memory_retention: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            flush_interval_secs: 10,
            verify_interval_secs: 60,
            memory_retention: 10_000,
        }
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the HTTP API.
    pub enabled: bool,
    /// HTTP listen address.
    pub listen: String,
    /// Optional API key for the control API.
    pub api_key: Option<String>,
    /// Enable permissive CORS.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:3710".into(),
            api_key: None,
            cors: false,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   -> {}", h)?;
        }
        Ok(())
    }
}

fn error(field: impl Into<String>, message: impl Into<String>, hint: Option<&str>) -> ConfigWarning {
    ConfigWarning {
        field: field.into(),
        message: message.into(),
        severity: WarningSeverity::Error,
        hint: hint.map(String::from),
    }
}

fn warning(field: impl Into<String>, message: impl Into<String>, hint: Option<&str>) -> ConfigWarning {
    ConfigWarning {
        field: field.into(),
        message: message.into(),
        severity: WarningSeverity::Warning,
        hint: hint.map(String::from),
    }
}

fn in_unit_range(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl NexusConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Registry ───
        if self.registry.missed_heartbeat_threshold == 0 {
            warnings.push(error(
                "registry.missed_heartbeat_threshold",
                "threshold is 0, every provider would be unreachable immediately",
                Some("Set to e.g. 3"),
            ));
        }
        if self.registry.sweep_interval_secs == 0 {
            warnings.push(error("registry.sweep_interval_secs", "sweep interval is 0", None));
        }
        if self.registry.failure_threshold == 0 {
            warnings.push(error("registry.failure_threshold", "failure threshold is 0", None));
        }

        // ── Permission rules ───
        let mut seen = HashSet::new();
        for rule in &self.permissions.rules {
            if let Err(e) = rule.validate() {
                warnings.push(error("permissions.rules", e.to_string(), None));
            }
            if !seen.insert(rule.id.as_str()) {
                warnings.push(error(
                    format!("permissions.rules.{}", rule.id),
                    "duplicate rule id",
                    Some("Rule ids must be unique"),
                ));
            }
        }
        if self.permissions.rules.is_empty() {
            warnings.push(ConfigWarning {
                field: "permissions.rules".into(),
                message: "no permission rules, every context request will be denied".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Router ───
        if self.router.provider_timeout_ms == 0 {
            warnings.push(error("router.provider_timeout_ms", "timeout is 0", Some("Default is 200")));
        }
        if self.router.max_fan_out == 0 {
            warnings.push(error("router.max_fan_out", "fan-out is 0", None));
        }
        if self.router.recency_half_life_secs == 0 {
            warnings.push(error("router.recency_half_life_secs", "half-life is 0", None));
        }
        if self.router.default_limit == 0 || self.router.default_limit > self.router.max_limit {
            warnings.push(error(
                "router.default_limit",
                format!(
                    "default_limit {} must be between 1 and max_limit {}",
                    self.router.default_limit, self.router.max_limit
                ),
                None,
            ));
        }
        let tw = &self.router.trust_weights;
        for (name, v) in [
            ("recency_weight", self.router.recency_weight),
            ("query_match_weight", self.router.query_match_weight),
            ("trust_weights.system", tw.system),
            ("trust_weights.verified", tw.verified),
            ("trust_weights.third_party", tw.third_party),
            ("trust_weights.untrusted", tw.untrusted),
        ] {
            if !in_unit_range(v) {
                warnings.push(error(format!("router.{name}"), format!("weight {v} is outside [0, 1]"), None));
            }
        }

        // ── Safety ───
        let s = &self.safety;
        if !in_unit_range(s.auto_approve_below) || !in_unit_range(s.block_at_or_above) {
            warnings.push(error("safety", "risk thresholds must be within [0, 1]", None));
        } else if s.auto_approve_below > s.block_at_or_above {
            warnings.push(error(
                "safety.auto_approve_below",
                format!(
                    "auto_approve_below {} is above block_at_or_above {}",
                    s.auto_approve_below, s.block_at_or_above
                ),
                Some("Thresholds are inverted"),
            ));
        }
        let iw = &s.impact_weights;
        for (name, v) in [
            ("impact_weights.low", iw.low),
            ("impact_weights.medium", iw.medium),
            ("impact_weights.high", iw.high),
            ("impact_weights.critical", iw.critical),
            ("partial_reversibility_penalty", s.partial_reversibility_penalty),
            ("irreversible_floor", s.irreversible_floor),
            ("deny_keyword_weight", s.deny_keyword_weight),
            ("flag_keyword_weight", s.flag_keyword_weight),
            ("sensitive_context_weight", s.sensitive_context_weight),
            ("sensitive_context_cap", s.sensitive_context_cap),
        ] {
            if !in_unit_range(v) {
                warnings.push(error(format!("safety.{name}"), format!("weight {v} is outside [0, 1]"), None));
            }
        }
        if s.irreversible_floor < s.auto_approve_below {
            warnings.push(warning(
                "safety.irreversible_floor",
                "floor is below the auto-approve threshold; irreversible actions still require approval",
                None,
            ));
        }

        // ── Approval ───
        if self.approval.timeout_secs == 0 {
            warnings.push(error("approval.timeout_secs", "timeout is 0", Some("Default is 300")));
        }
        if self.approval.timeout_policy == TimeoutPolicy::Allow {
            warnings.push(warning(
                "approval.timeout_policy",
                format!(
                    "allow-by-timeout is enabled for risk below {}",
                    self.approval.allow_on_timeout_max_risk
                ),
                Some("Irreversible actions are always denied on timeout"),
            ));
        }

        // ── Engine ───
        if self.engine.execution_timeout_secs == 0 {
            warnings.push(error("engine.execution_timeout_secs", "timeout is 0", None));
        }
        if self.engine.lock_timeout_ms == 0 {
            warnings.push(error("engine.lock_timeout_ms", "timeout is 0", None));
        }

        // ── Rollback ───
        if self.rollback.retention_secs == 0 {
            warnings.push(warning(
                "rollback.retention_secs",
                "retention is 0, snapshots expire immediately",
                None,
            ));
        }

        // ── Spans ───
        let max = nexus_core::MAX_SPAN_SECS;
        for (name, secs) in [
            ("registry.purge_grace_secs", self.registry.purge_grace_secs),
            ("registry.sweep_interval_secs", self.registry.sweep_interval_secs),
            ("permissions.limiter_cleanup_secs", self.permissions.limiter_cleanup_secs),
            ("router.recency_half_life_secs", self.router.recency_half_life_secs),
            ("router.cache_ttl_secs", self.router.cache_ttl_secs),
            ("router.provider_timeout_ms", self.router.provider_timeout_ms / 1000),
            ("rollback.retention_secs", self.rollback.retention_secs),
            ("rollback.tombstone_secs", self.rollback.tombstone_secs),
            ("approval.timeout_secs", self.approval.timeout_secs),
            ("engine.execution_timeout_secs", self.engine.execution_timeout_secs),
            ("engine.lock_timeout_ms", self.engine.lock_timeout_ms / 1000),
            ("engine.approval_sweep_secs", self.engine.approval_sweep_secs),
            ("audit.flush_interval_secs", self.audit.flush_interval_secs),
            ("audit.verify_interval_secs", self.audit.verify_interval_secs),
        ] {
            if secs > max {
                warnings.push(error(
                    name,
                    format!("span of {secs}s exceeds the {max}s maximum"),
                    None,
                ));
            }
        }

        // ── Audit ───
        if self.audit.memory_retention == 0 {
            warnings.push(error("audit.memory_retention", "retention is 0", None));
        }
        if self.audit.db_path.is_none() {
            warnings.push(ConfigWarning {
                field: "audit.db_path".into(),
                message: "audit entries are kept in memory only".into(),
                severity: WarningSeverity::Info,
                hint: Some("Set audit.db_path to persist the chain".into()),
            });
        }

        // ── Server ───
        if self.server.enabled
            && self.server.api_key.is_none()
            && !self.server.listen.starts_with("127.0.0.1")
            && !self.server.listen.starts_with("localhost")
        {
            warnings.push(warning(
                "server.api_key",
                format!("listening on {} without an API key", self.server.listen),
                Some("Set server.api_key or NEXUS_API_KEY"),
            ));
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(error(
                "logging.format",
                format!("unknown log format '{}'", self.logging.format),
                Some("Valid values: pretty, json, compact"),
            ));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(warning(
                "logging.level",
                format!("unknown log level '{}'", self.logging.level),
                Some("Valid values: trace, debug, info, warn, error"),
            ));
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  - {}", errors.join("\n  - ")));
        }

        Ok(warnings)
    }
}
