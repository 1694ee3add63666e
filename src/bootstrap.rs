use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    adapters::RailRegistry,
    api::handler::AppState,
    config::Config,
    error::AppResult,
    ledger::{InMemoryLedger, LedgerRepository, LedgerStore},
    notifications::{self, OperatorNotifier},
    orchestrator::PaymentOrchestrator,
    payout::PayoutClient,
    settlement::{ApprovalGate, CustodyMonitor, DepositPoller, SafetyMonitor, WorkerScheduler},
};

/// Everything `main` needs: the HTTP state and, when enabled, the workers
pub struct App {
    pub state: AppState,
    pub scheduler: Option<WorkerScheduler>,
}

pub async fn initialize(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    // Ledger
    let ledger: Arc<dyn LedgerStore> = match &config.database_url {
        Some(database_url) => {
            let pool = initialize_database(database_url).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - using the in-process ledger, state is lost on restart");
            Arc::new(InMemoryLedger::new())
        }
    };
    info!("✅ Ledger initialized");

    // External rails
    let rails = RailRegistry::from_config(config)?;

    // Settlement core
    let payout = Arc::new(PayoutClient::new(
        rails.rail.clone(),
        ledger.clone(),
        config.payout.clone(),
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        ledger.clone(),
        rails.escrow.clone(),
        payout,
        config.lifecycle.clone(),
    ));
    info!("✅ Payment orchestrator initialized");

    let notifier: Arc<dyn OperatorNotifier> =
        Arc::from(notifications::from_config(&config.notifications)?);

    let approval_gate = Arc::new(ApprovalGate::new(ledger.clone(), orchestrator.clone()));
    let safety_monitor = Arc::new(SafetyMonitor::new(
        ledger.clone(),
        orchestrator.clone(),
        rails.escrow.clone(),
        notifier,
        config.safety.clone(),
        Duration::from_secs(config.workers.safety_scan_secs),
    ));

    // Background workers
    let scheduler = if config.workers.enabled {
        let deposit_poller = Arc::new(DepositPoller::new(
            rails.deposits.clone(),
            ledger.clone(),
            orchestrator.clone(),
            Duration::from_secs(config.workers.deposit_poll_secs),
        ));
        let custody_monitor = Arc::new(CustodyMonitor::new(
            ledger.clone(),
            orchestrator.clone(),
            Duration::from_secs(config.workers.custody_scan_secs),
        ));

        info!(
            "✅ Workers scheduled: deposits every {}s, custody every {}s, safety every {}s",
            config.workers.deposit_poll_secs,
            config.workers.custody_scan_secs,
            config.workers.safety_scan_secs
        );
        Some(
            WorkerScheduler::new()
                .with_task(deposit_poller)
                .with_task(custody_monitor)
                .with_task(safety_monitor.clone()),
        )
    } else {
        warn!("⚠️  Background workers disabled");
        None
    };

    let state = AppState {
        orchestrator,
        approval_gate,
        safety_monitor,
        rail_mode: config.rail_mode,
    };

    Ok(App { state, scheduler })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sandbox_without_database_boots_in_process() {
        let config = Config {
            workers: crate::config::WorkerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Config::default()
        };
        let app = initialize(&config).await.unwrap();
        assert!(app.scheduler.is_none());
        assert!(app.state.orchestrator.events(uuid::Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn enabled_workers_get_a_scheduler() {
        let app = initialize(&Config::default()).await.unwrap();
        assert!(app.scheduler.is_some());
    }
}
