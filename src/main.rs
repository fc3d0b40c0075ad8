use anyhow::Result;
use registry_rs::config::{backend_kind, http_addr, options_from_env, register_ttl};
use registry_rs::registry::announce::{local_node, Announcer};
use registry_rs::registry::proxy::server::start_server;
use registry_rs::utils::logger;
use registry_rs::{init_env, new_registry, Registry, Service, WatchOptions, REGISTRY_LOG_DIR};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "registry";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log every registry change until the watcher ends.
fn spawn_event_logger(registry: Arc<dyn Registry>) {
    tokio::spawn(async move {
        let mut watcher = match registry.watch(WatchOptions::default()).await {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("Failed to watch registry: {}", e);
                return;
            }
        };
        loop {
            match watcher.next().await {
                Ok(result) => info!(
                    "Registry {} event: service {} version {} ({} nodes)",
                    result.action,
                    result.service.name,
                    result.service.version,
                    result.service.nodes.len()
                ),
                Err(e) => {
                    info!("Registry watcher ended: {}", e);
                    break;
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    init_env();

    // Initialize logging system
    let _guard = logger::init(REGISTRY_LOG_DIR.to_string())?;

    info!("Starting registry service...");
    let kind = backend_kind()?;
    let addr = http_addr()?;
    let ttl = register_ttl()?;
    let registry = new_registry(kind, options_from_env()?).await?;
    info!("Using {} registry backend", registry.name());

    spawn_event_logger(Arc::clone(&registry));

    // Start HTTP server
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server_registry = Arc::clone(&registry);
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        start_server(server_registry, addr, shutdown).await
    });

    // Announce the daemon itself
    let mut metadata = BTreeMap::new();
    metadata.insert("protocol".to_string(), "http".to_string());
    metadata.insert("registry".to_string(), registry.name().to_string());
    let node = local_node(SERVICE_NAME, addr.port(), metadata)?;
    let service = Service::new(SERVICE_NAME, SERVICE_VERSION).with_node(node);
    let announcer = Announcer::new(Arc::clone(&registry), service, ttl, None);
    if let Err(e) = announcer.start().await {
        error!("Failed to announce registry service: {}", e);
    }

    tokio::signal::ctrl_c().await?;

    // Graceful shutdown
    info!("Shutting down...");
    if let Err(e) = announcer.stop().await {
        error!("Failed to deregister registry service: {}", e);
    }
    shutdown_tx.send_replace(true);
    match server.await? {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
