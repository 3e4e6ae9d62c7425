use std::sync::Arc;
use tracing::{error, info, warn};

use nexus_config::{ConfigLoader, NexusConfig};
use nexus_runtime::Broker;

pub(super) async fn cmd_start(
    config: NexusConfig,
    no_server: bool,
    config_loader: ConfigLoader,
) -> nexus_core::Result<()> {
    println!("Nexus v{}", env!("CARGO_PKG_VERSION"));
    println!("   Config: {}", config_loader.path().display());
    match &config.audit.db_path {
        Some(path) => println!("   Audit log: {}", path.display()),
        None => println!("   Audit log: in-memory"),
    }
    println!("   Rules: {}", config.permissions.rules.len());

    // Kept alive for the lifetime of the broker
    let _watcher = match config_loader.watch() {
        Ok(w) => {
            println!("   Config hot-reload: enabled");
            Some(w)
        }
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    let broker = Arc::new(Broker::new(config.clone())?);
    broker.start()?;
    broker.watch_config(config_loader.subscribe());

    let server = if !no_server && config.server.enabled {
        println!("   API: http://{}", config.server.listen);
        let broker = broker.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = nexus_server::serve(broker).await {
                error!(error = %e, "API server failed");
            }
        }))
    } else {
        println!("   API: disabled");
        None
    };
    println!();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    broker.shutdown().await?;
    if let Some(handle) = server
        && let Err(e) = handle.await
    {
        error!(error = %e, "API server task panicked");
    }
    Ok(())
}
