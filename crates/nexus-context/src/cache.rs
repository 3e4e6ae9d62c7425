use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nexus_core::{ContextRecord, add_span};

#[derive(Debug, Clone)]
struct Cached {
    record: ContextRecord,
    expires_at: DateTime<Utc>,
}

/// Outcome of offering a pushed record to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    Inserted,
    /// Replaced an older record of the same type from the same provider.
    Superseded,
    /// An equal-or-newer record is already cached.
    Stale,
}

/// Pushed records, at most one per (provider, context type).
#[derive(Default)]
pub struct ContextCache {
    entries: DashMap<(String, String), Cached>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ContextRecord, ttl: Duration, now: DateTime<Utc>) -> CacheInsert {
        let key = (record.provider_id.clone(), record.context_type.clone());
        let fresh = Cached {
            expires_at: add_span(now, ttl),
            record,
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let expired = current.expires_at <= now;
                if !expired && current.record.produced_at >= fresh.record.produced_at {
                    return CacheInsert::Stale;
                }
                slot.insert(fresh);
                CacheInsert::Superseded
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                CacheInsert::Inserted
            }
        }
    }

    /// The live record for the pair, if any.
    pub fn get(&self, provider_id: &str, context_type: &str, now: DateTime<Utc>) -> Option<ContextRecord> {
        let key = (provider_id.to_string(), context_type.to_string());
        self.entries
            .get(&key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.record.clone())
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.expires_at > now);
        before - self.entries.len()
    }

    pub fn purge_provider(&self, provider_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(p, _), _| p != provider_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn rec(provider: &str, at: DateTime<Utc>) -> ContextRecord {
        let mut r = ContextRecord::new("network", Map::new()).produced_at(at);
        r.provider_id = provider.into();
        r
    }

    #[test]
    fn newer_supersedes_older_is_ignored() {
        let cache = ContextCache::new();
        let t0 = Utc::now();
        let ttl = Duration::seconds(60);
        assert_eq!(cache.insert(rec("net", t0), ttl, t0), CacheInsert::Inserted);
        assert_eq!(
            cache.insert(rec("net", t0 - Duration::seconds(5)), ttl, t0),
            CacheInsert::Stale
        );
        assert_eq!(
            cache.insert(rec("net", t0 + Duration::seconds(5)), ttl, t0),
            CacheInsert::Superseded
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("net", "network", t0).unwrap().produced_at,
            t0 + Duration::seconds(5)
        );
    }

    #[test]
    fn ttl_expiry_and_purge() {
        let cache = ContextCache::new();
        let t0 = Utc::now();
        cache.insert(rec("net", t0), Duration::seconds(10), t0);
        cache.insert(rec("dns", t0), Duration::seconds(100), t0);
        assert!(cache.get("net", "network", t0 + Duration::seconds(10)).is_none());
        assert_eq!(cache.evict_expired(t0 + Duration::seconds(10)), 1);
        assert_eq!(cache.purge_provider("dns"), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn expiry_saturates_near_calendar_end() {
        let cache = ContextCache::new();
        let late = DateTime::<Utc>::MAX_UTC - Duration::seconds(30);
        let outcome = cache.insert(rec("net", late), Duration::MAX, late);
        assert_eq!(outcome, CacheInsert::Inserted);
        assert!(cache.get("net", "network", late).is_some());
    }
}
