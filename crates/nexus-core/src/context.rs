use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::types::{ConsumerId, ProviderId, Sensitivity, TrustTier};

/// What a provider declares about itself when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    /// Context types this provider can answer for, e.g. "filesystem", "network".
    pub context_types: BTreeSet<String>,
    pub trust_tier: TrustTier,
    /// Expected seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
}

impl ProviderDescriptor {
    pub fn new(
        id: impl Into<String>,
        context_types: impl IntoIterator<Item = impl Into<String>>,
        trust_tier: TrustTier,
        heartbeat_interval_secs: u64,
    ) -> Self {
        Self {
            id: id.into(),
            context_types: context_types.into_iter().map(Into::into).collect(),
            trust_tier,
            heartbeat_interval_secs,
        }
    }

    /// Reject descriptors that can never be routed to.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(crate::NexusError::MalformedDescriptor(
                "provider id is empty".into(),
            ));
        }
        if self.id == crate::WILDCARD {
            return Err(crate::NexusError::MalformedDescriptor(
                "provider id '*' is reserved".into(),
            ));
        }
        if self.context_types.is_empty() {
            return Err(crate::NexusError::MalformedDescriptor(format!(
                "provider '{}' declares no context types",
                self.id
            )));
        }
        if let Some(bad) = self
            .context_types
            .iter()
            .find(|t| t.trim().is_empty() || t.as_str() == crate::WILDCARD)
        {
            return Err(crate::NexusError::MalformedDescriptor(format!(
                "provider '{}' declares invalid context type '{}'",
                self.id, bad
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(crate::NexusError::MalformedDescriptor(format!(
                "provider '{}' has a zero heartbeat interval",
                self.id
            )));
        }
        if self.heartbeat_interval_secs > crate::MAX_SPAN_SECS {
            return Err(crate::NexusError::MalformedDescriptor(format!(
                "provider '{}' heartbeat interval {}s exceeds the {}s maximum",
                self.id,
                self.heartbeat_interval_secs,
                crate::MAX_SPAN_SECS
            )));
        }
        Ok(())
    }
}

/// Optional narrowing applied to gathered records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextFilters {
    /// Keep only records carrying at least one of these tags.
    pub tags: Vec<String>,
    /// Keep only records produced at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep only records produced at or before this instant.
    pub until: Option<DateTime<Utc>>,
}

impl ContextFilters {
    pub fn matches(&self, record: &ContextRecord) -> bool {
        if !self.tags.is_empty() && !self.tags.iter().any(|t| record.tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.since
            && record.produced_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && record.produced_at > until
        {
            return false;
        }
        true
    }
}

/// A consumer's request for context. Ephemeral: only an audit summary survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub requester: ConsumerId,
    pub context_types: Vec<String>,
    /// Free-text query used for term-overlap relevance scoring.
    #[serde(default)]
    pub query: Option<String>,
    /// Maximum records returned. 0 = router default.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub filters: ContextFilters,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ContextRequest {
    pub fn new(
        requester: impl Into<String>,
        context_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            requester: requester.into(),
            context_types: context_types.into_iter().map(Into::into).collect(),
            query: None,
            limit: 0,
            filters: ContextFilters::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One piece of context produced by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Stamped by the router; whatever a provider puts here is overwritten.
    #[serde(default)]
    pub provider_id: ProviderId,
    pub context_type: String,
    pub payload: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub produced_at: DateTime<Utc>,
    /// Assigned by the router, never by the provider.
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cache lifetime for pushed records. None = router default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl ContextRecord {
    /// Reject records whose cache lifetime cannot be represented.
    pub fn validate(&self) -> crate::Result<()> {
        if self.context_type.trim().is_empty() {
            return Err(crate::NexusError::ConfigValidation {
                field: "context_type".into(),
                reason: "record has no context type".into(),
            });
        }
        if let Some(ttl) = self.ttl_secs
            && ttl > crate::MAX_SPAN_SECS
        {
            return Err(crate::NexusError::ConfigValidation {
                field: "ttl_secs".into(),
                reason: format!("ttl {ttl}s exceeds the {}s maximum", crate::MAX_SPAN_SECS),
            });
        }
        Ok(())
    }

    pub fn new(context_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            provider_id: String::new(),
            context_type: context_type.into(),
            payload,
            produced_at: Utc::now(),
            relevance: 0.0,
            sensitivity: Sensitivity::Public,
            tags: Vec::new(),
            ttl_secs: None,
        }
    }

    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn produced_at(mut self, at: DateTime<Utc>) -> Self {
        self.produced_at = at;
        self
    }
}

/// Ranked result of a gather.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextResponse {
    pub records: Vec<ContextRecord>,
    /// True when at least one candidate provider timed out or errored.
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_providers: Vec<ProviderId>,
}

/// Implemented by anything the router can pull context from on demand.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Must match the id the provider registered with.
    fn id(&self) -> &str;

    /// Produce records of `context_type` for `request`. The router enforces
    /// its own timeout around this call.
    async fn fetch(
        &self,
        request: &ContextRequest,
        context_type: &str,
    ) -> crate::Result<Vec<ContextRecord>>;
}
