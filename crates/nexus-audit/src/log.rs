use chrono::Utc;
use nexus_core::{Event, EventBus, NexusError, Result, Severity};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainAnchor, ChainReport, verify_chain};
use crate::entry::{AuditEntry, AuditKind};
use crate::store::AuditStore;

/// A page of the audit export, with the verification metadata a reader
/// needs to check it independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    /// Pass as `from_seq` to get the next page. None at the head.
    pub next_seq: Option<u64>,
    pub head: ChainAnchor,
    /// Whether the page links into a verified chain.
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_error: Option<String>,
}

struct Inner {
    /// Retained tail of the chain.
    entries: VecDeque<AuditEntry>,
    /// Link just before `entries.front()`.
    anchor: ChainAnchor,
    head: ChainAnchor,
    /// Highest seq known to be in the store.
    flushed_seq: u64,
    halted: Option<String>,
}

/// The append-only audit log. All appends go through one mutex, which is
/// what makes sequence numbers gap- and duplicate-free.
pub struct AuditLog {
    inner: Mutex<Inner>,
    flush_lock: Mutex<()>,
    store: Option<AuditStore>,
    retention: usize,
    events: Option<EventBus>,
}

impl AuditLog {
    /// In-memory log keeping at most `retention` entries.
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                anchor: ChainAnchor::genesis(),
                head: ChainAnchor::genesis(),
                flushed_seq: 0,
                halted: None,
            }),
            flush_lock: Mutex::new(()),
            store: None,
            retention: retention.max(1),
            events: None,
        }
    }

    /// Log backed by `store`, resuming the chain from its head. The stored
    /// chain is verified first; a broken chain yields a halted log.
    pub fn with_store(store: AuditStore, retention: usize) -> Result<Self> {
        let mut log = Self::new(retention);
        let stored = store.load_all()?;
        let check = verify_chain(&stored, None);
        {
            let inner = log.inner.get_mut();
            if let Some(last) = stored.last() {
                inner.anchor = ChainAnchor::of(last);
                inner.head = ChainAnchor::of(last);
                inner.flushed_seq = last.seq;
            }
            if let Err(e) = check {
                error!(error = %e, "stored audit chain failed verification, log halted");
                inner.halted = Some(e.to_string());
            }
        }
        info!(head_seq = log.inner.get_mut().head.seq, "audit chain resumed from store");
        log.store = Some(store);
        Ok(log)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Append one entry. Fails with `AuditHalted` once integrity is lost.
    pub fn append(
        &self,
        actor: &str,
        kind: AuditKind,
        severity: Severity,
        payload: Value,
    ) -> Result<AuditEntry> {
        let entry = {
            let mut inner = self.inner.lock();
            if let Some(reason) = &inner.halted {
                return Err(NexusError::AuditHalted(reason.clone()));
            }
            let entry = AuditEntry::seal(
                inner.head.seq + 1,
                inner.head.hash.clone(),
                actor.to_string(),
                kind,
                severity,
                payload,
                Utc::now(),
            );
            inner.head = ChainAnchor::of(&entry);
            inner.entries.push_back(entry.clone());
            if inner.entries.len() > self.retention {
                self.trim(&mut inner);
            }
            entry
        };

        match severity {
            Severity::Critical => error!(seq = entry.seq, actor, kind = %kind, "audit"),
            Severity::Warning => warn!(seq = entry.seq, actor, kind = %kind, "audit"),
            Severity::Info => debug!(seq = entry.seq, actor, kind = %kind, "audit"),
        }
        Ok(entry)
    }

    /// Drop entries beyond retention. With a store, only flushed entries go.
    fn trim(&self, inner: &mut Inner) -> usize {
        let mut dropped = 0;
        while inner.entries.len() > self.retention {
            let Some(front) = inner.entries.front() else {
                break;
            };
            if self.store.is_some() && front.seq > inner.flushed_seq {
                break;
            }
            if let Some(e) = inner.entries.pop_front() {
                inner.anchor = ChainAnchor::of(&e);
                dropped += 1;
            }
        }
        dropped
    }

    /// Re-walk the retained chain. A failure halts the log.
    pub fn verify(&self) -> Result<ChainReport> {
        let mut inner = self.inner.lock();
        let entries: Vec<AuditEntry> = inner.entries.iter().cloned().collect();
        match verify_chain(&entries, Some(&inner.anchor)) {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(error = %e, "audit chain integrity failure, halting writes");
                self.halt_locked(&mut inner, e.to_string());
                Err(e)
            }
        }
    }

    /// Refuse every further append. The first reason given sticks.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(error = %reason, "audit log halted");
        let mut inner = self.inner.lock();
        self.halt_locked(&mut inner, reason);
    }

    fn halt_locked(&self, inner: &mut Inner, reason: String) {
        if inner.halted.is_some() {
            return;
        }
        inner.halted = Some(reason.clone());
        if let Some(bus) = &self.events {
            bus.publish(Event::AuditHalted { reason });
        }
    }

    /// Up to `limit` entries starting at `from_seq`, oldest first. Entries
    /// already compacted out of memory are read back from the store.
    pub fn export(&self, from_seq: u64, limit: usize) -> Result<AuditPage> {
        let from_seq = from_seq.max(1);
        let limit = limit.max(1);
        let verification = self.verify();

        let (mut entries, head, first_in_memory) = {
            let inner = self.inner.lock();
            let entries: Vec<AuditEntry> = inner
                .entries
                .iter()
                .filter(|e| e.seq >= from_seq)
                .take(limit)
                .cloned()
                .collect();
            (entries, inner.head.clone(), inner.anchor.seq + 1)
        };

        if from_seq < first_in_memory
            && let Some(store) = &self.store
        {
            let older = store.load_range(from_seq, limit)?;
            let mut merged: Vec<AuditEntry> = older
                .into_iter()
                .filter(|e| e.seq < first_in_memory)
                .collect();
            merged.extend(entries);
            merged.truncate(limit);
            entries = merged;
        }

        let next_seq = entries
            .last()
            .map(|e| e.seq + 1)
            .filter(|next| *next <= head.seq);

        // The page must link on its own, as well as sit in a verified chain.
        let page_check = entries.first().map(|first| {
            let anchor = ChainAnchor {
                seq: first.seq - 1,
                hash: first.prev_hash.clone(),
            };
            verify_chain(&entries, Some(&anchor))
        });

        let verification_error = match (verification, page_check) {
            (Err(e), _) | (Ok(_), Some(Err(e))) => Some(e.to_string()),
            _ => None,
        };

        Ok(AuditPage {
            verified: verification_error.is_none(),
            verification_error,
            entries,
            next_seq,
            head,
        })
    }

    /// Persist entries not yet in the store. Returns how many were written.
    pub fn flush(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let _guard = self.flush_lock.lock();
        let pending: Vec<AuditEntry> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .filter(|e| e.seq > inner.flushed_seq)
                .cloned()
                .collect()
        };
        let written = store.append_batch(&pending)?;
        if let Some(last) = pending.last() {
            let mut inner = self.inner.lock();
            inner.flushed_seq = last.seq;
            self.trim(&mut inner);
            debug!(written, flushed_seq = last.seq, "audit log flushed");
        }
        Ok(written)
    }

    /// Drop retained entries beyond the memory limit. Returns how many went.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        self.trim(&mut inner)
    }

    pub fn is_halted(&self) -> bool {
        self.inner.lock().halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.inner.lock().halted.clone()
    }

    pub fn head(&self) -> ChainAnchor {
        self.inner.lock().head.clone()
    }

    /// Entries currently held in memory.
    pub fn retained(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Retained entries matching `kind`, oldest first.
    pub fn entries_of(&self, kind: AuditKind) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}
