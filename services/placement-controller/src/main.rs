//! Placement controller
//!
//! Runs the placement reconcile loop over an in-memory store seeded from an
//! optional manifest.

use std::sync::Arc;

use anyhow::Result;
use placement_controller::{
    config,
    decision::{DecisionMaker, FirstMatch},
    engine::PlacementReconciler,
    manifest::Manifest,
    store::{MemoryStore, PlacementStore},
    worker::ReconcileWorker,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to PLACEMENT_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting placement controller");
    info!(
        resync_interval_secs = config.resync_interval.as_secs(),
        advisor_poll_interval_secs = config.advisor_poll_interval.as_secs(),
        max_concurrent = config.max_concurrent,
        "Configuration loaded"
    );

    let manifest = match &config.manifest {
        Some(path) => match Manifest::from_path(path) {
            Ok(manifest) => {
                info!(
                    path = %path.display(),
                    targets = manifest.targets.len(),
                    target_sets = manifest.target_sets.len(),
                    requests = manifest.requests.len(),
                    "Manifest loaded"
                );
                manifest
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to load manifest");
                return Err(e);
            }
        },
        None => {
            warn!("No manifest configured, starting with an empty catalog");
            Manifest::default()
        }
    };

    let store: Arc<dyn PlacementStore> = Arc::new(MemoryStore::new());
    let catalog = Arc::new(manifest.catalog());
    manifest.seed(store.as_ref()).await?;

    let policy = FirstMatch::new(config.tie_break);
    info!(policy = policy.name(), tie_break = ?policy.tie_break(), "Decision policy selected");

    let reconciler = Arc::new(PlacementReconciler::new(
        store.clone(),
        catalog,
        Arc::new(policy),
        config.reconciler(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(reconciler, store, config.worker());
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for reconcile worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    match tokio::time::timeout(shutdown_timeout, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reconcile worker panicked"),
        Err(e) => warn!(error = %e, "Reconcile worker did not shut down in time"),
    }

    info!("Placement controller shutdown complete");
    Ok(())
}
