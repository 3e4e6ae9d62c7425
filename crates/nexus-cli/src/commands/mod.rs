use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use nexus_config::{ConfigLoader, NexusConfig, WarningSeverity};
use nexus_core::{NexusError, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod audit;
mod start;

/// Nexus: context broker and safety-gated autonomy engine
#[derive(Parser)]
#[command(name = "nexus", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to nexus.toml config file
    #[arg(short, long, global = true, env = "NEXUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (registry, router, autonomy engine, HTTP API)
    Start {
        /// Don't start the HTTP API
        #[arg(long)]
        no_server: bool,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Audit configuration for safety issues
    Doctor,
    /// Inspect a persisted audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Show version and build info
    Version,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Re-walk the stored hash chain from genesis
    Verify {
        /// Audit database (default: audit.db_path from config)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print stored entries in sequence order
    Export {
        /// Audit database (default: audit.db_path from config)
        #[arg(long)]
        db: Option<PathBuf>,
        /// First sequence number
        #[arg(long, default_value = "1")]
        from: u64,
        /// Maximum entries
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.logging.level.clone())
        };
        init_tracing(&config, &log_level)?;

        match self.command {
            Commands::Start { no_server } => {
                start::cmd_start(config, no_server, config_loader).await
            }
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config),
            Commands::Audit { action } => match action {
                AuditAction::Verify { db } => audit::cmd_verify(&config, db),
                AuditAction::Export {
                    db,
                    from,
                    limit,
                    json,
                } => audit::cmd_export(&config, db, from, limit, json),
            },
            Commands::Version => Self::cmd_version(),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: &NexusConfig, json: bool) -> Result<()> {
        let rendered = if json {
            serde_json::to_string_pretty(config)?
        } else {
            toml::to_string_pretty(config).map_err(|e| NexusError::Config(e.to_string()))?
        };
        println!("{rendered}");
        Ok(())
    }

    fn cmd_doctor(config: &NexusConfig) -> Result<()> {
        println!("Nexus Doctor: configuration audit");
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Err(NexusError::Config("configuration is invalid".into()));
            }
        };
        for w in &warnings {
            println!("  {w}");
        }

        let findings = doctor_findings(config);
        for f in &findings {
            println!("  [{}] {}", f.tag(), f.message);
        }

        let warn_count = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Warning)
            .count()
            + findings.iter().filter(|f| f.warning).count();
        let info_count = warnings.len() + findings.len() - warn_count;
        println!();
        println!("  {warn_count} warnings, {info_count} suggestions");
        Ok(())
    }

    fn cmd_version() -> Result<()> {
        println!("Nexus v{}", env!("CARGO_PKG_VERSION"));
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "nexus", &mut std::io::stdout());
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
fn init_tracing(config: &NexusConfig, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
    Ok(())
}

/// A doctor check beyond schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Finding {
    warning: bool,
    message: String,
}

impl Finding {
    fn warn(message: impl Into<String>) -> Self {
        Self {
            warning: true,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            warning: false,
            message: message.into(),
        }
    }

    fn tag(&self) -> &'static str {
        if self.warning { "warning" } else { "info" }
    }
}

fn is_loopback(listen: &str) -> bool {
    listen.starts_with("127.") || listen.starts_with("localhost") || listen.starts_with("[::1]")
}

fn doctor_findings(config: &NexusConfig) -> Vec<Finding> {
    let mut findings = Vec::new();

    if config.server.enabled && config.server.api_key.is_none() && !is_loopback(&config.server.listen)
    {
        findings.push(Finding::warn(format!(
            "server.api_key: API on {} is reachable off-host without a key",
            config.server.listen
        )));
    }
    if config.audit.db_path.is_none() {
        findings.push(Finding::info(
            "audit.db_path: audit log is in-memory only and is lost on exit",
        ));
    }
    if config.permissions.rules.is_empty() {
        findings.push(Finding::info(
            "permissions.rules: no rules, so every context request is denied",
        ));
    }
    if config.safety.deny_keywords.is_empty() {
        findings.push(Finding::warn(
            "safety.deny_keywords: empty, destructive targets are scored by impact alone",
        ));
    }
    if config.approval.timeout_policy == nexus_config::TimeoutPolicy::Allow {
        findings.push(Finding::warn(format!(
            "approval.timeout_policy: unanswered approvals below risk {} execute on timeout",
            config.approval.allow_on_timeout_max_risk
        )));
    }
    findings
}
