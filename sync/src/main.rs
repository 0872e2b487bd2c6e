//! Tidemark Sync - reconciles a local SQLite replica with a cloud replica.
//!
//! Runs one round per configured table in each direction and logs the
//! reports. Ctrl-C cancels rounds that have not started committing.

use futures::future::join_all;
use std::sync::Arc;
use tidemark_engine::Origin;
use tidemark_sync::{
    Config, DriverOptions, LoopbackTransport, ReconciliationDriver, Replica, SqliteStorage,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidemark_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        peer = %config.peer,
        tables = config.tables.len(),
        strategy = ?config.strategy,
        "Starting Tidemark Sync"
    );

    let device = Arc::new(SqliteStorage::connect(&config.database_url, Origin::Device).await?);
    let cloud = Arc::new(SqliteStorage::connect(&config.remote_url, Origin::Cloud).await?);

    let options = DriverOptions::from(&config);
    let to_cloud = LoopbackTransport::new(&*config.peer, Arc::new(Replica::new(cloud.clone())));
    let to_device =
        LoopbackTransport::new(&*config.local_peer, Arc::new(Replica::new(device.clone())));
    let upstream = ReconciliationDriver::new(device, Arc::new(to_cloud), options);
    let downstream = ReconciliationDriver::new(cloud, Arc::new(to_device), options);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling rounds");
                cancel.cancel();
            }
        }
    });

    let mut failures = 0;
    for (driver, peer) in [(&upstream, &config.peer), (&downstream, &config.local_peer)] {
        let rounds = config
            .tables
            .iter()
            .map(|table| driver.run_round(peer, table, &cancel));
        for result in join_all(rounds).await {
            match result {
                Ok(report) => {
                    let report = serde_json::to_string(&report)?;
                    tracing::info!(report = %report, "Round report");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(peer = %peer, error = %e, "Round did not complete");
                }
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} round(s) failed").into());
    }
    tracing::info!("Replicas reconciled");
    Ok(())
}
