use chrono::{DateTime, Utc};
use nexus_audit::{AuditKind, AuditLog};
use nexus_config::RegistryConfig;
use nexus_core::{
    ContextProvider, Event, EventBus, HealthStatus, NexusError, ProviderDescriptor, ProviderId,
    Result, Severity, span_secs,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request counters kept per provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub total_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProviderStats {
    pub fn avg_latency_ms(&self) -> f64 {
        let ok = self.requests.saturating_sub(self.failures);
        if ok == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / ok as f64
        }
    }
}

/// A registered context source as the registry sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub descriptor: ProviderDescriptor,
    pub health: HealthStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable_since: Option<DateTime<Utc>>,
    /// Whether the router can pull from this provider, or only read its pushes.
    pub pullable: bool,
    pub stats: ProviderStats,
}

impl Provider {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn declares(&self, context_type: &str) -> bool {
        self.descriptor.context_types.contains(context_type)
    }
}

struct Entry {
    provider: Provider,
    source: Option<Arc<dyn ContextProvider>>,
}

/// Providers that changed state during one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub unreachable: Vec<ProviderId>,
    pub purged: Vec<ProviderId>,
}

/// Tracks context sources, their declared capabilities, and liveness.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderId, Entry>>,
    config: RwLock<RegistryConfig>,
    audit: Arc<AuditLog>,
    events: EventBus,
}

impl ProviderRegistry {
    pub fn new(config: RegistryConfig, audit: Arc<AuditLog>, events: EventBus) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            audit,
            events,
        }
    }

    pub fn update_config(&self, config: RegistryConfig) {
        *self.config.write() = config;
    }

    /// Register a push-only provider.
    pub fn register(&self, descriptor: ProviderDescriptor) -> Result<ProviderId> {
        self.insert(descriptor, None)
    }

    /// Register a provider the router can pull from.
    pub fn register_with_source(
        &self,
        descriptor: ProviderDescriptor,
        source: Arc<dyn ContextProvider>,
    ) -> Result<ProviderId> {
        if source.id() != descriptor.id {
            return Err(NexusError::MalformedDescriptor(format!(
                "source id '{}' does not match descriptor id '{}'",
                source.id(),
                descriptor.id
            )));
        }
        self.insert(descriptor, Some(source))
    }

    fn insert(
        &self,
        descriptor: ProviderDescriptor,
        source: Option<Arc<dyn ContextProvider>>,
    ) -> Result<ProviderId> {
        descriptor.validate()?;
        let id = descriptor.id.clone();

        let mut providers = self.providers.write();
        // An unreachable provider may come back under the same id.
        if let Some(existing) = providers.get(&id)
            && existing.provider.health != HealthStatus::Unreachable
        {
            return Err(NexusError::DuplicateProvider(id));
        }

        self.audit.append(
            &id,
            AuditKind::ProviderRegistered,
            Severity::Info,
            json!({
                "provider": id,
                "context_types": descriptor.context_types,
                "trust_tier": descriptor.trust_tier,
                "heartbeat_interval_secs": descriptor.heartbeat_interval_secs,
                "pullable": source.is_some(),
            }),
        )?;

        let now = Utc::now();
        providers.insert(
            id.clone(),
            Entry {
                provider: Provider {
                    descriptor,
                    health: HealthStatus::Healthy,
                    registered_at: now,
                    last_heartbeat: now,
                    unreachable_since: None,
                    pullable: source.is_some(),
                    stats: ProviderStats::default(),
                },
                source,
            },
        );
        drop(providers);

        info!(provider = %id, "provider registered");
        self.events.publish(Event::ProviderRegistered {
            provider_id: id.clone(),
        });
        Ok(id)
    }

    /// Record liveness. A degraded or unreachable provider becomes healthy.
    pub fn heartbeat(&self, id: &str) -> Result<HealthStatus> {
        self.heartbeat_at(id, Utc::now())
    }

    pub fn heartbeat_at(&self, id: &str, now: DateTime<Utc>) -> Result<HealthStatus> {
        let mut providers = self.providers.write();
        let entry = providers
            .get_mut(id)
            .ok_or_else(|| NexusError::ProviderNotFound(id.to_string()))?;
        let p = &mut entry.provider;
        p.last_heartbeat = now;

        if p.health != HealthStatus::Healthy {
            let previous = p.health;
            self.audit.append(
                id,
                AuditKind::ProviderRecovered,
                Severity::Info,
                json!({ "provider": id, "previous": previous }),
            )?;
            p.health = HealthStatus::Healthy;
            p.unreachable_since = None;
            p.stats.consecutive_failures = 0;
            info!(provider = %id, %previous, "provider recovered");
            self.events.publish(Event::ProviderHealthChanged {
                provider_id: id.to_string(),
                health: HealthStatus::Healthy,
            });
        } else {
            debug!(provider = %id, "heartbeat");
        }
        Ok(HealthStatus::Healthy)
    }

    pub fn deregister(&self, id: &str) -> Result<()> {
        let mut providers = self.providers.write();
        if !providers.contains_key(id) {
            return Err(NexusError::ProviderNotFound(id.to_string()));
        }
        self.audit.append(
            id,
            AuditKind::ProviderDeregistered,
            Severity::Info,
            json!({ "provider": id }),
        )?;
        providers.remove(id);
        drop(providers);

        info!(provider = %id, "provider deregistered");
        self.events.publish(Event::ProviderDeregistered {
            provider_id: id.to_string(),
        });
        Ok(())
    }

    /// Healthy providers declaring `context_type`, ordered by id.
    pub fn list(&self, context_type: &str) -> Vec<Provider> {
        self.sources(context_type)
            .into_iter()
            .map(|(p, _)| p)
            .collect()
    }

    /// Like [`list`](Self::list), with the pull handle for each provider.
    pub fn sources(&self, context_type: &str) -> Vec<(Provider, Option<Arc<dyn ContextProvider>>)> {
        let providers = self.providers.read();
        let mut out: Vec<_> = providers
            .values()
            .filter(|e| e.provider.health == HealthStatus::Healthy && e.provider.declares(context_type))
            .map(|e| (e.provider.clone(), e.source.clone()))
            .collect();
        out.sort_by(|a, b| a.0.id().cmp(b.0.id()));
        out
    }

    pub fn get(&self, id: &str) -> Option<Provider> {
        self.providers.read().get(id).map(|e| e.provider.clone())
    }

    /// Every registered provider regardless of health, ordered by id.
    pub fn all(&self) -> Vec<Provider> {
        let mut out: Vec<Provider> = self
            .providers
            .read()
            .values()
            .map(|e| e.provider.clone())
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_success(&self, id: &str, latency: std::time::Duration) {
        if let Some(entry) = self.providers.write().get_mut(id) {
            let stats = &mut entry.provider.stats;
            stats.requests += 1;
            stats.consecutive_failures = 0;
            stats.total_latency_ms += latency.as_millis() as u64;
        }
    }

    /// Count a failed fetch. Enough consecutive failures demote a healthy
    /// provider to degraded, which takes it out of routing until it heartbeats.
    pub fn record_failure(&self, id: &str, reason: &str) -> Result<Option<HealthStatus>> {
        let threshold = self.config.read().failure_threshold;
        let mut providers = self.providers.write();
        let Some(entry) = providers.get_mut(id) else {
            return Ok(None);
        };
        let p = &mut entry.provider;
        p.stats.requests += 1;
        p.stats.failures += 1;
        p.stats.consecutive_failures += 1;
        p.stats.last_error = Some(reason.to_string());

        if p.health == HealthStatus::Healthy && p.stats.consecutive_failures >= threshold {
            self.audit.append(
                "registry",
                AuditKind::ProviderDegraded,
                Severity::Warning,
                json!({
                    "provider": id,
                    "consecutive_failures": p.stats.consecutive_failures,
                    "last_error": reason,
                }),
            )?;
            p.health = HealthStatus::Degraded;
            warn!(provider = %id, failures = p.stats.consecutive_failures, "provider degraded");
            self.events.publish(Event::ProviderHealthChanged {
                provider_id: id.to_string(),
                health: HealthStatus::Degraded,
            });
            return Ok(Some(HealthStatus::Degraded));
        }
        Ok(None)
    }

    /// Mark providers that missed too many heartbeats unreachable, and purge
    /// providers that stayed unreachable past the grace window.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let config = self.config.read().clone();
        let grace = span_secs(config.purge_grace_secs);
        let mut report = SweepReport::default();
        let mut providers = self.providers.write();

        for (id, entry) in providers.iter_mut() {
            let p = &mut entry.provider;
            match p.health {
                HealthStatus::Healthy | HealthStatus::Degraded => {
                    let allowed = span_secs(
                        p.descriptor
                            .heartbeat_interval_secs
                            .saturating_mul(u64::from(config.missed_heartbeat_threshold)),
                    );
                    if now - p.last_heartbeat >= allowed {
                        self.audit.append(
                            "registry",
                            AuditKind::ProviderUnreachable,
                            Severity::Warning,
                            json!({
                                "provider": id,
                                "last_heartbeat": p.last_heartbeat,
                                "missed_threshold": config.missed_heartbeat_threshold,
                            }),
                        )?;
                        p.health = HealthStatus::Unreachable;
                        p.unreachable_since = Some(now);
                        warn!(provider = %id, "provider unreachable");
                        report.unreachable.push(id.clone());
                    }
                }
                HealthStatus::Unreachable => {
                    let since = p.unreachable_since.unwrap_or(now);
                    if now - since >= grace {
                        self.audit.append(
                            "registry",
                            AuditKind::ProviderPurged,
                            Severity::Info,
                            json!({ "provider": id, "unreachable_since": since }),
                        )?;
                        info!(provider = %id, "provider purged");
                        report.purged.push(id.clone());
                    }
                }
            }
        }
        for id in &report.purged {
            providers.remove(id);
        }
        drop(providers);

        for id in &report.unreachable {
            self.events.publish(Event::ProviderHealthChanged {
                provider_id: id.clone(),
                health: HealthStatus::Unreachable,
            });
        }
        for id in &report.purged {
            self.events.publish(Event::ProviderPurged {
                provider_id: id.clone(),
            });
        }
        report.unreachable.sort();
        report.purged.sort();
        Ok(report)
    }
}
