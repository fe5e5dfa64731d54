//! Tandem Server - relay for realtime state synchronization.

use std::sync::Arc;

use tandem_server::config::Config;
use tandem_server::storage::FileSystemStorage;
use tandem_server::{create_app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tandem Server on {}", config.addr());

    let storage = Arc::new(FileSystemStorage::new(&config.storage_path));
    tokio::fs::create_dir_all(storage.dir()).await?;
    tracing::info!("Storing projects in {}", storage.dir().display());

    let state = AppState::new(config.clone(), storage);
    let registry = state.registry.clone();
    let app = create_app(state);

    // Start server
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("WebSocket endpoint: ws://{}/ws/{{project_id}}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let failed = registry.persist_all().await;
    tracing::info!(failed, "Server stopped, documents persisted");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
