mod adapters;
mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod middleware;
mod notifications;
mod orchestrator;
mod payout;
mod server;
mod settlement;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settlement::WorkerScheduler;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,escrow_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("🛑 Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Escrow Settlement Backend");

    // Load configuration
    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;
    info!("⚙️  Rail mode: {:?}", config.rail_mode);

    let bootstrap::App { state, scheduler } = bootstrap::initialize(&config).await?;

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = scheduler
        .map(|scheduler| scheduler.start(shutdown_rx))
        .unwrap_or_default();

    // Create HTTP server
    let app = server::create_app(state, &config);

    // Run the Server
    server::run_server(app, &config.bind_address, shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    WorkerScheduler::join(workers).await;

    info!("👋 Server stopped");

    Ok(())
}
