use printfleet::config::AppConfig;
use printfleet::discovery::UdpDiscovery;
use printfleet::logging::init_logging;
use printfleet::printer_store::JsonFileStore;
use printfleet::protocol::NetworkConnector;
use printfleet::service::PrinterService;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let _log_guard = init_logging(&config.log)?;

    info!("========================================");
    info!("PrintFleet daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    let store_path = config.store_path();
    info!("Printer store at {:?}", store_path);

    let connector = Arc::new(NetworkConnector::new(&config.connection));
    let discovery = Arc::new(UdpDiscovery::new(config.connection.discovery_port));
    let store = Arc::new(JsonFileStore::new(store_path));
    let auto_connect = config.connection.auto_connect;

    let service = PrinterService::new(config, connector, discovery, store)?;

    let mut lifecycle = service.subscribe_lifecycle();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            debug!("Lifecycle: {:?} {}", event.event, event.context_id);
        }
    });

    if auto_connect {
        let response = service.auto_connect_saved().await;
        match response.data {
            Some(batch) => {
                info!("Reconnected {} saved printers", batch.connected.len());
                for failure in batch.failures {
                    warn!("Could not reconnect {}: {}", failure.target, failure.message);
                }
            }
            None => error!(
                "Auto-connect failed: {}",
                response.message.unwrap_or_default()
            ),
        }
    }

    info!("Daemon running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    service.shutdown().await;
    info!("Goodbye");
    Ok(())
}
