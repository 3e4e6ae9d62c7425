use chrono::{DateTime, Utc};
use nexus_core::{NexusError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::{debug, info};

use crate::entry::{AuditEntry, format_timestamp, parse_severity};

fn storage(e: impl std::fmt::Display) -> NexusError {
    NexusError::Storage(e.to_string())
}

const SELECT_COLUMNS: &str = "SELECT seq, actor, kind, severity, payload, payload_digest, prev_hash, entry_hash, timestamp FROM audit_log";

/// SQLite persistence for audit entries.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Open or create the audit database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening audit store");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY,
                actor TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_digest TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_log(kind);
            ",
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write entries in one transaction. A duplicate seq aborts the whole batch.
    pub fn append_batch(&self, entries: &[AuditEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO audit_log (seq, actor, kind, severity, payload, payload_digest, prev_hash, entry_hash, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )
                .map_err(storage)?;
            for e in entries {
                let seq = i64::try_from(e.seq).map_err(storage)?;
                stmt.execute(params![
                    seq,
                    e.actor,
                    e.kind.as_str(),
                    e.severity.to_string(),
                    serde_json::to_string(&e.payload)?,
                    e.payload_digest,
                    e.prev_hash,
                    e.entry_hash,
                    format_timestamp(&e.timestamp),
                ])
                .map_err(storage)?;
            }
        }
        tx.commit().map_err(storage)?;
        debug!(count = entries.len(), "audit batch persisted");
        Ok(entries.len())
    }

    /// Up to `limit` entries with `seq >= from_seq`, in order.
    pub fn load_range(&self, from_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let from = i64::try_from(from_seq).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!("{SELECT_COLUMNS} WHERE seq >= ?1 ORDER BY seq ASC LIMIT ?2"))
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![from, limit], raw_row)
            .map_err(storage)?;
        rows.map(|r| r.map_err(storage).and_then(decode))
            .collect()
    }

    pub fn load_all(&self) -> Result<Vec<AuditEntry>> {
        self.load_range(0, usize::MAX)
    }

    /// The last persisted entry.
    pub fn head(&self) -> Result<Option<AuditEntry>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(&format!("{SELECT_COLUMNS} ORDER BY seq DESC LIMIT 1"), [], raw_row)
            .optional()
            .map_err(storage)?;
        raw.map(decode).transpose()
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))
            .map_err(storage)?;
        Ok(n.max(0) as u64)
    }
}

/// Columns as stored, before parsing.
struct RawRow {
    seq: i64,
    actor: String,
    kind: String,
    severity: String,
    payload: String,
    payload_digest: String,
    prev_hash: String,
    entry_hash: String,
    timestamp: String,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        seq: row.get(0)?,
        actor: row.get(1)?,
        kind: row.get(2)?,
        severity: row.get(3)?,
        payload: row.get(4)?,
        payload_digest: row.get(5)?,
        prev_hash: row.get(6)?,
        entry_hash: row.get(7)?,
        timestamp: row.get(8)?,
    })
}

fn decode(raw: RawRow) -> Result<AuditEntry> {
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&raw.timestamp)
        .map_err(storage)?
        .with_timezone(&Utc);
    Ok(AuditEntry {
        seq: u64::try_from(raw.seq).map_err(storage)?,
        actor: raw.actor,
        kind: raw.kind.parse().map_err(NexusError::Storage)?,
        severity: parse_severity(&raw.severity).map_err(NexusError::Storage)?,
        payload: serde_json::from_str(&raw.payload)?,
        payload_digest: raw.payload_digest,
        prev_hash: raw.prev_hash,
        entry_hash: raw.entry_hash,
        timestamp,
    })
}
