use nexus_core::{NexusError, Result};
use serde::{Deserialize, Serialize};

use crate::entry::{AuditEntry, GENESIS_HASH, digest_payload};

/// The link a verified run of entries hangs off: the seq and hash of the
/// entry just before the first one. `seq == 0` with the genesis hash means
/// "start of the chain".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub seq: u64,
    pub hash: String,
}

impl ChainAnchor {
    pub fn genesis() -> Self {
        Self {
            seq: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }

    pub fn of(entry: &AuditEntry) -> Self {
        Self {
            seq: entry.seq,
            hash: entry.entry_hash.clone(),
        }
    }
}

impl Default for ChainAnchor {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Summary of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub verified: usize,
    pub first_seq: Option<u64>,
    pub head: ChainAnchor,
}

/// Re-walk `entries` from `anchor` (genesis when `None`), checking sequence
/// continuity, payload digests, entry hashes, and prev-hash links.
pub fn verify_chain(entries: &[AuditEntry], anchor: Option<&ChainAnchor>) -> Result<ChainReport> {
    let start = anchor.cloned().unwrap_or_default();
    let mut expected = start.clone();

    for entry in entries {
        let broken = |reason: String| NexusError::AuditIntegrity {
            seq: entry.seq,
            reason,
        };
        if entry.seq != expected.seq + 1 {
            return Err(broken(format!(
                "sequence gap: expected {}, found {}",
                expected.seq + 1,
                entry.seq
            )));
        }
        if entry.prev_hash != expected.hash {
            return Err(broken(format!(
                "chain broken: expected prev {}, found {}",
                expected.hash, entry.prev_hash
            )));
        }
        let digest = digest_payload(&entry.payload);
        if digest != entry.payload_digest {
            return Err(broken(format!(
                "payload digest mismatch: stored {}, computed {}",
                entry.payload_digest, digest
            )));
        }
        let computed = entry.compute_hash();
        if computed != entry.entry_hash {
            return Err(broken(format!(
                "entry hash mismatch: stored {}, computed {}",
                entry.entry_hash, computed
            )));
        }
        expected = ChainAnchor::of(entry);
    }

    Ok(ChainReport {
        verified: entries.len(),
        first_seq: entries.first().map(|e| e.seq),
        head: expected,
    })
}
