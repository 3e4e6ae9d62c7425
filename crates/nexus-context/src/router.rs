use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::RouterConfig;
use nexus_core::{
    ContextProvider, ContextRecord, ContextRequest, ContextResponse, HealthStatus, NexusError,
    Result, Severity, TrustTier, span_secs,
};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheInsert, ContextCache};
use crate::guard::PermissionGuard;
use crate::registry::{Provider, ProviderRegistry};
use crate::relevance::RelevanceScorer;

/// One permitted (provider, context type) pair to query.
struct Candidate {
    provider: Provider,
    source: Option<Arc<dyn ContextProvider>>,
    context_type: String,
}

enum FetchOutcome {
    Records {
        provider_id: String,
        trust: TrustTier,
        records: Vec<ContextRecord>,
    },
    Failed {
        provider_id: String,
        reason: String,
    },
}

/// Routes context requests to permitted providers and ranks what comes back.
pub struct ContextRouter {
    registry: Arc<ProviderRegistry>,
    guard: Arc<PermissionGuard>,
    cache: ContextCache,
    audit: Arc<AuditLog>,
    config: RwLock<RouterConfig>,
}

impl ContextRouter {
    pub fn new(
        config: RouterConfig,
        registry: Arc<ProviderRegistry>,
        guard: Arc<PermissionGuard>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            guard,
            cache: ContextCache::new(),
            audit,
            config: RwLock::new(config),
        }
    }

    pub fn update_config(&self, config: RouterConfig) {
        *self.config.write() = config;
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<PermissionGuard> {
        &self.guard
    }

    /// Gather, filter, rank, and truncate context for `request`.
    ///
    /// Denied providers are dropped silently (each check is audited); only
    /// when nothing is left does the caller get `NoAccessibleContext`.
    /// Providers that time out or fail are skipped and the response is
    /// flagged partial.
    pub async fn gather(&self, request: &ContextRequest) -> Result<ContextResponse> {
        let config = self.config.read().clone();
        let types: BTreeSet<&str> = request
            .context_types
            .iter()
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
            .collect();
        if types.is_empty() {
            return Err(NexusError::ConfigValidation {
                field: "context_types".into(),
                reason: "request names no context types".into(),
            });
        }

        // 1–2. Resolve candidates and drop the ones the requester may not read.
        let mut candidates = Vec::new();
        let mut denied = 0usize;
        for context_type in &types {
            for (provider, source) in self.registry.sources(context_type) {
                let decision = self
                    .guard
                    .check(&request.requester, provider.id(), context_type)?;
                if decision.is_allowed() {
                    candidates.push(Candidate {
                        provider,
                        source,
                        context_type: context_type.to_string(),
                    });
                } else {
                    debug!(requester = %request.requester, provider = %provider.id(), context_type, "candidate denied");
                    denied += 1;
                }
            }
        }
        if candidates.is_empty() {
            warn!(requester = %request.requester, ?types, denied, "no accessible context");
            return Err(NexusError::NoAccessibleContext);
        }

        // 3. Serve from cache where possible, pull the rest concurrently.
        let now = Utc::now();
        let timeout = std::time::Duration::from_millis(config.provider_timeout_ms);
        let outcomes: Vec<FetchOutcome> = stream::iter(candidates)
            .map(|c| self.fetch_one(c, request, timeout, now))
            .buffer_unordered(config.max_fan_out.max(1))
            .collect()
            .await;

        // 4. Filter and score.
        let clearance = self.guard.clearance(&request.requester);
        let scorer = RelevanceScorer::new(&config, request.query.as_deref(), Utc::now());
        let mut records = Vec::new();
        let mut failed_providers = Vec::new();
        let mut withheld = 0usize;
        for outcome in outcomes {
            match outcome {
                FetchOutcome::Records {
                    provider_id,
                    trust,
                    records: batch,
                } => {
                    for mut record in batch {
                        if record.sensitivity > clearance {
                            withheld += 1;
                            continue;
                        }
                        if !request.filters.matches(&record) {
                            continue;
                        }
                        record.provider_id = provider_id.clone();
                        record.relevance = scorer.score(&record, trust);
                        records.push(record);
                    }
                }
                FetchOutcome::Failed {
                    provider_id,
                    reason,
                } => {
                    self.registry.record_failure(&provider_id, &reason)?;
                    if !failed_providers.contains(&provider_id) {
                        failed_providers.push(provider_id);
                    }
                }
            }
        }

        // 5. Rank and bound.
        records.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| b.produced_at.cmp(&a.produced_at))
        });
        let limit = match request.limit {
            0 => config.default_limit,
            n => n.min(config.max_limit),
        };
        records.truncate(limit);
        failed_providers.sort();
        let partial = !failed_providers.is_empty();

        self.audit.append(
            &request.requester,
            AuditKind::ContextGathered,
            if partial { Severity::Warning } else { Severity::Info },
            json!({
                "requester": request.requester,
                "context_types": types,
                "returned": records.len(),
                "denied_candidates": denied,
                "withheld_by_clearance": withheld,
                "partial": partial,
                "failed_providers": failed_providers,
            }),
        )?;
        info!(
            requester = %request.requester,
            returned = records.len(),
            partial,
            "context gathered"
        );

        Ok(ContextResponse {
            records,
            partial,
            failed_providers,
        })
    }

    async fn fetch_one(
        &self,
        candidate: Candidate,
        request: &ContextRequest,
        timeout: std::time::Duration,
        now: DateTime<Utc>,
    ) -> FetchOutcome {
        let provider_id = candidate.provider.id().to_string();
        let trust = candidate.provider.descriptor.trust_tier;
        let context_type = candidate.context_type;

        if let Some(cached) = self.cache.get(&provider_id, &context_type, now) {
            return FetchOutcome::Records {
                provider_id,
                trust,
                records: vec![cached],
            };
        }
        let Some(source) = candidate.source else {
            // Push-only provider with nothing cached.
            return FetchOutcome::Records {
                provider_id,
                trust,
                records: Vec::new(),
            };
        };

        let started = Instant::now();
        match tokio::time::timeout(timeout, source.fetch(request, &context_type)).await {
            Ok(Ok(records)) => {
                self.registry.record_success(&provider_id, started.elapsed());
                // Providers answer only for the type they were asked about.
                let records = records
                    .into_iter()
                    .filter(|r| r.context_type == context_type)
                    .collect();
                FetchOutcome::Records {
                    provider_id,
                    trust,
                    records,
                }
            }
            Ok(Err(e)) => {
                warn!(provider = %provider_id, error = %e, "provider fetch failed");
                FetchOutcome::Failed {
                    provider_id,
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(provider = %provider_id, timeout_ms = timeout.as_millis() as u64, "provider fetch timed out");
                FetchOutcome::Failed {
                    provider_id,
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                }
            }
        }
    }

    /// Cache a record pushed by a provider. Returns whether it was kept.
    pub fn push(&self, provider_id: &str, mut record: ContextRecord) -> Result<bool> {
        record.validate()?;
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| NexusError::ProviderNotFound(provider_id.to_string()))?;
        if provider.health == HealthStatus::Unreachable {
            return Err(NexusError::ProviderUnavailable {
                provider: provider_id.to_string(),
                reason: "provider is unreachable; heartbeat first".into(),
            });
        }
        if !provider.declares(&record.context_type) {
            return Err(NexusError::UndeclaredContextType {
                provider: provider_id.to_string(),
                context_type: record.context_type,
            });
        }

        record.provider_id = provider_id.to_string();
        record.relevance = 0.0;
        let ttl_secs = record.ttl_secs.unwrap_or(self.config.read().cache_ttl_secs);
        let context_type = record.context_type.clone();
        let outcome = self
            .cache
            .insert(record, span_secs(ttl_secs), Utc::now());

        self.audit.append(
            provider_id,
            AuditKind::ContextPushed,
            Severity::Info,
            json!({
                "provider": provider_id,
                "context_type": context_type,
                "ttl_secs": ttl_secs,
                "outcome": match outcome {
                    CacheInsert::Inserted => "inserted",
                    CacheInsert::Superseded => "superseded",
                    CacheInsert::Stale => "stale",
                },
            }),
        )?;
        debug!(provider = %provider_id, %context_type, ?outcome, "context pushed");
        Ok(outcome != CacheInsert::Stale)
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.cache.evict_expired(now)
    }

    /// Forget everything a provider pushed.
    pub fn purge_provider(&self, provider_id: &str) -> usize {
        self.cache.purge_provider(provider_id)
    }

    pub fn cached_records(&self) -> usize {
        self.cache.len()
    }
}
