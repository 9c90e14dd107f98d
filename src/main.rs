use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use scriptguard::config::Config;
use scriptguard::core::pipeline::{GuardEvent, run_pipeline};
use scriptguard::db::SharedDatabase;
use scriptguard::guard::GuardService;
use scriptguard::notify::DesktopNotifier;
use scriptguard::sri::SriClient;
use scriptguard::tasks;

/// Interval between maintenance passes (expired-script re-verification and
/// retention sweep).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("scriptguard=info".parse().unwrap()),
        )
        .init();

    tracing::info!("scriptguard starting...");

    // Load configuration
    let config = Arc::new(Config::load("scriptguard.toml"));
    if !config.monitoring.enabled {
        tracing::warn!("Monitoring is disabled in configuration");
    }

    // Open the monitoring database
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create database directory");
    }
    let db = SharedDatabase::open(db_path).expect("Failed to open monitoring database");
    tracing::info!("Monitoring database opened at {}", config.database.path);

    // Collaborators: digest fetcher and operator notifications
    let fetcher = Arc::new(SriClient::new(config.fetch_timeout()));
    let notifier = Arc::new(DesktopNotifier::new(&config.alerts));

    let service = Arc::new(GuardService::new(
        config.clone(),
        db,
        fetcher.clone(),
        notifier,
    ));
    tracing::info!(
        "Guard service ready ({} store origins configured)",
        config.monitoring.store_urls.len()
    );

    // Inbound event channel; transport adapters feed events into guard_tx
    let (guard_tx, guard_rx) = mpsc::unbounded_channel::<GuardEvent>();
    let pipeline = tokio::spawn(run_pipeline(guard_rx, service.clone()));
    tracing::info!("Pipeline started");

    // Periodic maintenance: expired-script re-verification + retention sweep
    let maintenance_service = service.clone();
    let maintenance_config = config.clone();
    let maintenance = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tasks::run_maintenance(&maintenance_service, fetcher.as_ref(), &maintenance_config)
                .await;
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");

    maintenance.abort();
    drop(guard_tx);
    let _ = pipeline.await;
    tracing::info!("scriptguard stopped");
}
