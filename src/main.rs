use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kaillera_relay::config::ServerConfig;
use kaillera_relay::lobby::Lobby;
use kaillera_relay::metrics::Metrics;
use kaillera_relay::net::connect::ConnectServer;
use kaillera_relay::net::controller::V086Controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Kaillera Relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, session ports {}-{}, max_users={}",
        config.bind_address,
        config.connect_port,
        config.port_range_start,
        config.port_range_end(),
        config.max_users
    );

    let metrics = Arc::new(Metrics::new());
    let lobby = Arc::new(Lobby::new(config.clone()));
    let controller = Arc::new(V086Controller::new(config.clone(), lobby.clone(), metrics.clone()));
    controller.start();

    let server = ConnectServer::bind(
        SocketAddr::new(config.bind_address, config.connect_port),
        controller.clone(),
    )
    .await?;

    // Expire idle users and nudge stalled games
    let maintenance_lobby = lobby.clone();
    let maintenance = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            maintenance_lobby.maintenance(Instant::now());
        }
    });

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Connect server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Cleanup
    maintenance.abort();
    controller.stop().await;
    lobby.shutdown();

    for action in controller.actions().summaries() {
        if action.performed > 0 || action.handled > 0 {
            info!(
                "{}: {} messages, {} events",
                action.name, action.performed, action.handled
            );
        }
    }
    info!("Final metrics:\n{}", metrics.to_prometheus());
    info!("Server stopped");

    Ok(())
}
