use nexus_audit::{AuditEntry, AuditStore, ChainReport, verify_chain};
use nexus_config::NexusConfig;
use nexus_core::{NexusError, Result};
use std::path::{Path, PathBuf};

/// `--db` wins over `audit.db_path`. The file must already exist.
fn resolve_db(config: &NexusConfig, db: Option<PathBuf>) -> Result<PathBuf> {
    let path = db.or_else(|| config.audit.db_path.clone()).ok_or_else(|| {
        NexusError::Config("no audit database: pass --db or set audit.db_path".into())
    })?;
    if !path.exists() {
        return Err(NexusError::Config(format!(
            "audit database not found: {}",
            path.display()
        )));
    }
    Ok(path)
}

fn verify_db(path: &Path) -> Result<ChainReport> {
    let store = AuditStore::open(path)?;
    let entries = store.load_all()?;
    verify_chain(&entries, None)
}

fn export_db(path: &Path, from: u64, limit: usize) -> Result<Vec<AuditEntry>> {
    AuditStore::open(path)?.load_range(from, limit)
}

pub(super) fn cmd_verify(config: &NexusConfig, db: Option<PathBuf>) -> Result<()> {
    let path = resolve_db(config, db)?;
    let report = verify_db(&path)?;
    println!("Audit chain OK: {}", path.display());
    println!("   Entries verified: {}", report.verified);
    if let Some(first) = report.first_seq {
        println!("   Sequence: {first}..={}", report.head.seq);
    }
    println!("   Head hash: {}", report.head.hash);
    Ok(())
}

pub(super) fn cmd_export(
    config: &NexusConfig,
    db: Option<PathBuf>,
    from: u64,
    limit: usize,
    json: bool,
) -> Result<()> {
    let path = resolve_db(config, db)?;
    let entries = export_db(&path, from, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for e in &entries {
        println!(
            "{:>6}  {}  {:<8} {:<24} {}  {}",
            e.seq,
            e.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            e.severity.to_string(),
            e.kind.to_string(),
            e.actor,
            e.payload
        );
    }
    if entries.is_empty() {
        println!("(no entries from seq {from})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_audit::{AuditKind, AuditLog};
    use nexus_core::Severity;
    use serde_json::json;

    fn seeded_db(dir: &Path, n: u64) -> PathBuf {
        let path = dir.join("audit.db");
        let log = AuditLog::with_store(AuditStore::open(&path).unwrap(), 100).unwrap();
        for i in 0..n {
            log.append("ops", AuditKind::PolicyMutated, Severity::Info, json!({ "i": i }))
                .unwrap();
        }
        log.flush().unwrap();
        path
    }

    #[test]
    fn test_verify_stored_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(dir.path(), 4);
        let report = verify_db(&path).unwrap();
        assert_eq!(report.verified, 4);
        assert_eq!(report.first_seq, Some(1));
        assert_eq!(report.head.seq, 4);
    }

    #[test]
    fn test_export_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_db(dir.path(), 5);
        let entries = export_db(&path, 2, 2).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(entries[0].actor, "ops");
    }

    #[test]
    fn test_db_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NexusConfig::default();
        assert!(resolve_db(&config, None).unwrap_err().is_config_error());

        let missing = dir.path().join("missing.db");
        assert!(
            resolve_db(&config, Some(missing))
                .unwrap_err()
                .is_config_error()
        );

        let path = seeded_db(dir.path(), 1);
        config.audit.db_path = Some(path.clone());
        assert_eq!(resolve_db(&config, None).unwrap(), path);
    }
}
