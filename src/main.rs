//! Parkwatch - parking violation scanner
//!
//! Main entry point for the scanner service.

use parkwatch::broker::{AmqpTransport, Transport};
use parkwatch::parking::PgParkingStore;
use parkwatch::state::{AppConfig, AppState};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parkwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Parkwatch v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        rabbitmq_host = %config.broker.host,
        rabbitmq_port = config.broker.port,
        crop_queue = %config.vision.crop_queue,
        classify_queue = %config.vision.classify_queue,
        director_url = config.director_url.as_deref().unwrap_or("-"),
        scan_interval_secs = config.scan_interval.as_secs(),
        dedup_window_hours = config.dedup_window.num_hours(),
        "Configuration loaded"
    );

    // Create database pool
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connected");

    // Connect broker
    let transport: Arc<dyn Transport> = Arc::new(AmqpTransport::connect(&config.broker).await?);
    tracing::info!("Broker connected");

    let store = Arc::new(PgParkingStore::new(pool.clone()));
    let state = AppState::build(config, transport, store)?;
    state.declare_request_queues().await?;

    if !state.vision.backend_healthy().await {
        tracing::warn!("Classification backend not reachable at startup");
    }

    state.scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    state.shutdown().await?;
    pool.close().await;
    tracing::info!("Parkwatch stopped");
    Ok(())
}
