use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lobby_engine_server::auth::{Authenticator, StaticTokenAuthenticator};
use lobby_engine_server::config::ServerConfig;
use lobby_engine_server::lobby::{JsonFileLobbyRepository, LobbyManager};
use lobby_engine_server::metrics::{self, Metrics};
use lobby_engine_server::net::transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Lobby Engine Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {}:{}, tick_rate={}, data_dir={}",
        config.bind_address,
        config.port,
        config.engine.target_tick_rate,
        config.data_dir.display()
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let repository = Arc::new(JsonFileLobbyRepository::new(&config.data_dir));
    let manager = LobbyManager::new(&config, repository, metrics.clone())?;

    let authenticator = StaticTokenAuthenticator::new(config.auth_tokens.clone());
    if authenticator.is_empty() {
        warn!("AUTH_TOKENS is empty, every connection will be refused");
    }
    let authenticator: Arc<dyn Authenticator> = Arc::new(authenticator);

    let listener = TcpListener::bind((config.bind_address, config.port)).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = transport::serve(listener, manager.clone(), authenticator) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    manager.shutdown_all();
    info!("Server stopped");

    Ok(())
}
