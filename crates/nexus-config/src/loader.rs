use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use nexus_core::NexusError;

use crate::schema::NexusConfig;

/// Loads and optionally hot-reloads the Nexus configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<NexusConfig>>,
    config_path: PathBuf,
    updates: Arc<watch::Sender<NexusConfig>>,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > NEXUS_CONFIG env > ~/.nexus/nexus.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("NEXUS_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nexus")
            .join("nexus.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> nexus_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            NexusConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        let (tx, _) = watch::channel(config.clone());
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            updates: Arc::new(tx),
        })
    }

    /// Wrap an already-built config (tests, embedding).
    pub fn from_config(config: NexusConfig) -> nexus_core::Result<Self> {
        Self::check(&config)?;
        let (tx, _) = watch::channel(config.clone());
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::from("nexus.toml"),
            updates: Arc::new(tx),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> NexusConfig {
        self.config.read().clone()
    }

    /// Get a shared reference to the live config.
    pub fn shared(&self) -> Arc<RwLock<NexusConfig>> {
        Arc::clone(&self.config)
    }

    /// Receive every validated revision after the current one.
    pub fn subscribe(&self) -> watch::Receiver<NexusConfig> {
        self.updates.subscribe()
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse_file(path: &Path) -> nexus_core::Result<NexusConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<NexusConfig>(&raw).map_err(|e| {
            NexusError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &NexusConfig) -> nexus_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(NexusError::Config(e)),
        }
    }

    /// Apply env var overrides (NEXUS_LOG_LEVEL, NEXUS_SERVER_LISTEN, etc.)
    fn apply_env_overrides(mut config: NexusConfig) -> NexusConfig {
        if let Ok(v) = std::env::var("NEXUS_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("NEXUS_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("NEXUS_AUDIT_DB") {
            config.audit.db_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("NEXUS_APPROVAL_TIMEOUT_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            config.approval.timeout_secs = secs;
        }
        // Config file takes priority, env is the fallback.
        if config.server.api_key.is_none()
            && let Ok(v) = std::env::var("NEXUS_API_KEY")
        {
            config.server.api_key = Some(v);
        }
        config
    }

    fn install(
        config: &RwLock<NexusConfig>,
        updates: &watch::Sender<NexusConfig>,
        new_config: NexusConfig,
    ) {
        *config.write() = new_config.clone();
        updates.send_replace(new_config);
    }

    /// Reload the config from disk. An invalid file leaves the current
    /// config in place and returns the error.
    pub fn reload(&self) -> nexus_core::Result<()> {
        if !self.config_path.exists() {
            return Err(NexusError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        Self::install(&self.config, &self.updates, new_config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> nexus_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let updates = Arc::clone(&self.updates);
        let path_for_event = self.config_path.clone();

        info!(config_path = ?self.config_path, "starting config file watcher");

        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    let parsed = ConfigLoader::parse_file(&path_for_event)
                        .map(ConfigLoader::apply_env_overrides)
                        .and_then(|c| ConfigLoader::check(&c).map(|_| c));
                    match parsed {
                        Ok(new_config) => {
                            ConfigLoader::install(&config, &updates, new_config);
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| NexusError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| NexusError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
