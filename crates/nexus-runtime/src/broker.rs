use chrono::{DateTime, Utc};
use nexus_audit::{AuditKind, AuditLog, AuditStore, ChainReport};
use nexus_config::{ConfigWarning, NexusConfig};
use nexus_context::{ContextRouter, PermissionGuard, ProviderRegistry, SweepReport};
use nexus_core::{Event, EventBus, NexusError, Result, Severity, span_secs, sub_span};
use nexus_autonomy::{ApprovalGateway, AutonomyEngine, RollbackManager, SafetyValidator};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SYSTEM_ACTOR: &str = "system";

/// What one housekeeping pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub limiter_windows: usize,
    pub snapshots_committed: usize,
    pub snapshots_purged: usize,
    pub actions_forgotten: usize,
    pub locks_dropped: usize,
}

/// Owns every component of the broker and the background tasks that keep
/// them current.
///
/// Components are constructed once in [`Broker::new`] and shared by `Arc`;
/// callers reach them through the accessors. [`Broker::start`] spawns the
/// periodic sweeps and [`Broker::shutdown`] stops them, records a final audit
/// entry and flushes the log.
pub struct Broker {
    config: RwLock<NexusConfig>,
    audit: Arc<AuditLog>,
    events: EventBus,
    registry: Arc<ProviderRegistry>,
    guard: Arc<PermissionGuard>,
    router: Arc<ContextRouter>,
    safety: Arc<SafetyValidator>,
    rollback: Arc<RollbackManager>,
    approvals: Arc<ApprovalGateway>,
    engine: Arc<AutonomyEngine>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    started_at: Instant,
}

impl Broker {
    pub fn new(config: NexusConfig) -> Result<Self> {
        for w in config.validate().map_err(NexusError::Config)? {
            warn!("{}", w);
        }

        let events = EventBus::default();
        let audit = match &config.audit.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let store = AuditStore::open(path)?;
                AuditLog::with_store(store, config.audit.memory_retention)?
            }
            None => AuditLog::new(config.audit.memory_retention),
        };
        let audit = Arc::new(audit.with_events(events.clone()));

        let registry = Arc::new(ProviderRegistry::new(
            config.registry.clone(),
            audit.clone(),
            events.clone(),
        ));
        let guard = Arc::new(PermissionGuard::new(&config.permissions, audit.clone())?);
        let router = Arc::new(ContextRouter::new(
            config.router.clone(),
            registry.clone(),
            guard.clone(),
            audit.clone(),
        ));
        let safety = Arc::new(SafetyValidator::new(config.safety.clone(), audit.clone()));
        let rollback = Arc::new(RollbackManager::new(config.rollback.clone(), audit.clone()));
        let approvals = Arc::new(ApprovalGateway::new(
            config.approval.clone(),
            audit.clone(),
            events.clone(),
        ));
        let engine = Arc::new(AutonomyEngine::new(
            config.engine.clone(),
            router.clone(),
            safety.clone(),
            rollback.clone(),
            approvals.clone(),
            audit.clone(),
            events.clone(),
        ));

        info!(
            persisted = audit.has_store(),
            rules = guard.rules().len(),
            "broker initialized"
        );

        Ok(Self {
            config: RwLock::new(config),
            audit,
            events,
            registry,
            guard,
            router,
            safety,
            rollback,
            approvals,
            engine,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Record startup and spawn the background sweeps. Calling it twice is
    /// a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("broker already started");
            return Ok(());
        }
        let config = self.config();
        self.audit.append(
            SYSTEM_ACTOR,
            AuditKind::BrokerStarted,
            Severity::Info,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "persisted": self.audit.has_store(),
                "rules": self.guard.rules().len(),
            }),
        )?;

        self.spawn_periodic("liveness", secs(config.registry.sweep_interval_secs), |b| async move {
            if let Err(e) = b.run_liveness_sweep(Utc::now()) {
                warn!(error = %e, "liveness sweep failed");
            }
        });
        self.spawn_periodic("approvals", secs(config.engine.approval_sweep_secs), |b| async move {
            if let Err(e) = b.run_approval_sweep(Utc::now()).await {
                warn!(error = %e, "approval sweep failed");
            }
        });
        self.spawn_periodic("audit-flush", secs(config.audit.flush_interval_secs), |b| async move {
            if let Err(e) = b.run_audit_flush() {
                error!(error = %e, "audit flush failed");
            }
        });
        self.spawn_periodic("audit-verify", secs(config.audit.verify_interval_secs), |b| async move {
            if let Err(e) = b.run_audit_verify() {
                error!(error = %e, "audit verification failed");
            }
        });
        self.spawn_periodic(
            "housekeeping",
            secs(config.permissions.limiter_cleanup_secs),
            |b| async move {
                if let Err(e) = b.run_housekeeping(Utc::now()) {
                    warn!(error = %e, "housekeeping failed");
                }
            },
        );

        info!(tasks = self.tasks.lock().len(), "broker started");
        Ok(())
    }

    /// Stop background tasks, record shutdown, and flush the audit log.
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        if !self.audit.is_halted() {
            self.audit.append(
                SYSTEM_ACTOR,
                AuditKind::Shutdown,
                Severity::Info,
                json!({
                    "uptime_secs": self.uptime().as_secs(),
                    "pending_approvals": self.approvals.len(),
                    "tracked_actions": self.engine.len(),
                }),
            )?;
        }
        let flushed = self.audit.flush()?;
        self.events.publish(Event::Shutdown);
        info!(flushed, "broker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Token cancelled on shutdown. Servers use it for graceful exit.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, every: Duration, tick: F)
    where
        F: Fn(Arc<Broker>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(broker) = weak.upgrade() else { break };
                        tick(broker).await;
                    }
                }
            }
            debug!(task = name, "background task stopped");
        });
        self.tasks.lock().push(handle);
    }

    // ── Sweeps ─────────────────────────────────────────────────

    /// Mark silent providers unreachable, purge expired ones along with
    /// their cached records, and evict stale pushes.
    pub fn run_liveness_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.registry.sweep(now)?;
        for id in &report.purged {
            let dropped = self.router.purge_provider(id);
            debug!(provider = %id, dropped, "purged provider cache");
        }
        let evicted = self.router.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, "evicted expired context records");
        }
        Ok(report)
    }

    /// Settle approvals whose window elapsed. Returns how many settled.
    pub async fn run_approval_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let settled = self.engine.expire_approvals(now).await?;
        if !settled.is_empty() {
            info!(count = settled.len(), "expired approvals settled");
        }
        Ok(settled.len())
    }

    pub fn run_audit_flush(&self) -> Result<usize> {
        let written = self.audit.flush()?;
        self.audit.compact();
        Ok(written)
    }

    /// Re-walk the retained chain. A failure halts the log.
    pub fn run_audit_verify(&self) -> Result<ChainReport> {
        let report = self.audit.verify()?;
        debug!(verified = report.verified, head = report.head.seq, "audit chain verified");
        Ok(report)
    }

    pub fn run_housekeeping(&self, now: DateTime<Utc>) -> Result<HousekeepingReport> {
        let tombstone_secs = self.config.read().rollback.tombstone_secs;
        let horizon = sub_span(now, span_secs(tombstone_secs));
        let report = HousekeepingReport {
            limiter_windows: self.guard.cleanup(now),
            snapshots_committed: self.rollback.commit_expired(now)?,
            snapshots_purged: self.rollback.purge(now),
            actions_forgotten: self.engine.forget_settled(horizon),
            locks_dropped: self.engine.cleanup_locks(),
        };
        if report != HousekeepingReport::default() {
            debug!(?report, "housekeeping pass");
        }
        Ok(report)
    }

    /// Deregister a provider and drop everything it pushed.
    pub fn deregister_provider(&self, id: &str) -> Result<usize> {
        self.registry.deregister(id)?;
        Ok(self.router.purge_provider(id))
    }

    // ── Configuration ──────────────────────────────────────────

    /// Apply a new configuration to the live components. Rule, clearance,
    /// and safety changes go through the audited admin paths under `actor`.
    pub fn apply_config(&self, actor: &str, new: NexusConfig) -> Result<Vec<ConfigWarning>> {
        let warnings = new.validate().map_err(NexusError::Config)?;
        let current = self.config();

        self.guard.replace_rules(actor, new.permissions.rules.clone())?;
        self.guard
            .set_default_clearance(actor, new.permissions.default_clearance)?;
        for consumer in current.permissions.clearances.keys() {
            if !new.permissions.clearances.contains_key(consumer) {
                self.guard
                    .set_clearance(actor, consumer, new.permissions.default_clearance)?;
            }
        }
        for (consumer, level) in &new.permissions.clearances {
            self.guard.set_clearance(actor, consumer, *level)?;
        }
        if serde_json::to_value(&current.safety)? != serde_json::to_value(&new.safety)? {
            self.safety.update_config(actor, new.safety.clone())?;
        }

        self.registry.update_config(new.registry.clone());
        self.router.update_config(new.router.clone());
        self.rollback.update_config(new.rollback.clone());
        self.approvals.update_config(new.approval.clone());
        self.engine.update_config(new.engine.clone());

        *self.config.write() = new;
        info!(actor, warnings = warnings.len(), "configuration applied");
        Ok(warnings)
    }

    /// Apply every configuration published on `updates` until shutdown.
    pub fn watch_config(self: &Arc<Self>, mut updates: watch::Receiver<NexusConfig>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = updates.borrow_and_update().clone();
                        let Some(broker) = weak.upgrade() else { break };
                        match broker.apply_config("config-reload", next) {
                            Ok(warnings) => {
                                for w in &warnings {
                                    warn!("{}", w);
                                }
                            }
                            Err(e) => error!(error = %e, "rejected reloaded configuration"),
                        }
                    }
                }
            }
            debug!("config watcher stopped");
        });
        self.tasks.lock().push(handle);
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn config(&self) -> NexusConfig {
        self.config.read().clone()
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<PermissionGuard> {
        &self.guard
    }

    pub fn router(&self) -> &Arc<ContextRouter> {
        &self.router
    }

    pub fn safety(&self) -> &Arc<SafetyValidator> {
        &self.safety
    }

    pub fn rollback(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    pub fn approvals(&self) -> &Arc<ApprovalGateway> {
        &self.approvals
    }

    pub fn engine(&self) -> &Arc<AutonomyEngine> {
        &self.engine
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n.max(1))
}
