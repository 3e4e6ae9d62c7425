//! Sliding-window limiter for rate-limited permission rules.
//!
//! Each (consumer, provider, context-type) triple gets its own window. Once a
//! window fills up it stays closed until the oldest hit ages out, so every
//! check in between gets the same answer without consulting the rules.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use nexus_core::{RateLimit, add_span, span_secs};
use std::collections::VecDeque;
use tracing::debug;

type Key = (String, String, String);

#[derive(Debug)]
struct Window {
    hits: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
    rule_id: String,
    span: Duration,
    last_seen: DateTime<Utc>,
}

impl Window {
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&oldest) = self.hits.front() {
            if now - oldest >= self.span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Default)]
pub struct SlidingWindowLimiter {
    windows: DashMap<Key, Window>,
}

fn key(consumer: &str, provider: &str, context_type: &str) -> Key {
    (consumer.to_string(), provider.to_string(), context_type.to_string())
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// If the triple is currently rate limited, the rule that limited it.
    pub fn blocked(
        &self,
        consumer: &str,
        provider: &str,
        context_type: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut window = self.windows.get_mut(&key(consumer, provider, context_type))?;
        match window.blocked_until {
            Some(until) if now < until => Some(window.rule_id.clone()),
            Some(_) => {
                window.blocked_until = None;
                window.prune(now);
                None
            }
            None => None,
        }
    }

    /// Count one allowed access against `limit`. Returns false, and closes
    /// the window, when the limit is already used up.
    pub fn acquire(
        &self,
        consumer: &str,
        provider: &str,
        context_type: &str,
        rule_id: &str,
        limit: &RateLimit,
        now: DateTime<Utc>,
    ) -> bool {
        let span = span_secs(limit.window_secs);
        let mut window = self
            .windows
            .entry(key(consumer, provider, context_type))
            .or_insert_with(|| Window {
                hits: VecDeque::new(),
                blocked_until: None,
                rule_id: rule_id.to_string(),
                span,
                last_seen: now,
            });
        // The governing rule may have changed since the window opened.
        if window.rule_id != rule_id || window.span != span {
            window.rule_id = rule_id.to_string();
            window.span = span;
        }
        window.last_seen = now;
        window.prune(now);

        if window.hits.len() < limit.max_requests as usize {
            window.hits.push_back(now);
            true
        } else {
            let reopen = window.hits.front().map_or(now, |oldest| add_span(*oldest, span));
            window.blocked_until = Some(reopen);
            debug!(consumer, provider, context_type, %reopen, "rate window closed");
            false
        }
    }

    /// Drop windows idle for longer than their span.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.blocked_until.is_some_and(|u| now < u) || now - w.last_seen < w.span
        });
        before - self.windows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
