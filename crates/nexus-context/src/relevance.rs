//! Relevance scoring for gathered records.
//!
//! score = recency + query overlap + trust
//!
//! * recency: `recency_weight * 0.5^(age / half_life)`
//! * query overlap: `query_match_weight * matched_terms / query_terms`
//! * trust: fixed weight per provider trust tier

use chrono::{DateTime, Utc};
use nexus_config::RouterConfig;
use nexus_core::{ContextRecord, TrustTier};
use serde_json::Value;
use std::collections::BTreeSet;

/// Lowercased alphanumeric terms, deduplicated.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn collect_terms(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => out.extend(tokenize(s)),
        Value::Number(n) => {
            out.insert(n.to_string());
        }
        Value::Bool(b) => {
            out.insert(b.to_string());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_terms(v, out)),
        Value::Object(map) => {
            for (k, v) in map {
                out.extend(tokenize(k));
                collect_terms(v, out);
            }
        }
        Value::Null => {}
    }
}

pub struct RelevanceScorer<'a> {
    config: &'a RouterConfig,
    query_terms: BTreeSet<String>,
    now: DateTime<Utc>,
}

impl<'a> RelevanceScorer<'a> {
    pub fn new(config: &'a RouterConfig, query: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            config,
            query_terms: query.map(tokenize).unwrap_or_default(),
            now,
        }
    }

    pub fn recency(&self, produced_at: DateTime<Utc>) -> f64 {
        let age = (self.now - produced_at).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life = self.config.recency_half_life_secs.max(1) as f64;
        self.config.recency_weight * 0.5_f64.powf(age / half_life)
    }

    /// Fraction of query terms found anywhere in the record.
    pub fn overlap(&self, record: &ContextRecord) -> f64 {
        if self.query_terms.is_empty() {
            return 0.0;
        }
        let mut haystack = tokenize(&record.context_type);
        for tag in &record.tags {
            haystack.extend(tokenize(tag));
        }
        for (k, v) in &record.payload {
            haystack.extend(tokenize(k));
            collect_terms(v, &mut haystack);
        }
        let matched = self.query_terms.intersection(&haystack).count();
        matched as f64 / self.query_terms.len() as f64
    }

    pub fn score(&self, record: &ContextRecord, trust: TrustTier) -> f64 {
        self.recency(record.produced_at)
            + self.config.query_match_weight * self.overlap(record)
            + self.config.trust_weights.weight(trust)
    }
}
