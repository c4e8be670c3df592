//! Periodic hot and warm archival.

use std::sync::Arc;
use std::time::Duration;

use archival::EventArchivalManager;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Runs one hot pass followed by one warm pass with the configured retention.
///
/// A failed pass is logged and does not stop the other.
pub async fn run_archival_pass(manager: &EventArchivalManager) {
    let config = manager.config();

    match manager.archive_hot_events(config.hot_retention_hours).await {
        Ok(report) => tracing::info!(
            archived = report.archived,
            skipped = report.skipped,
            failures = report.failures,
            events = report.events,
            "hot archival pass finished"
        ),
        Err(e) => {
            metrics::counter!("archival_worker_pass_errors_total", "tier" => "hot").increment(1);
            tracing::error!(error = %e, "hot archival pass failed");
        }
    }

    match manager.archive_warm_events(config.warm_retention_days).await {
        Ok(report) => tracing::info!(
            archived = report.archived,
            failures = report.failures,
            events = report.events,
            "warm archival pass finished"
        ),
        Err(e) => {
            metrics::counter!("archival_worker_pass_errors_total", "tier" => "warm").increment(1);
            tracing::error!(error = %e, "warm archival pass failed");
        }
    }
    metrics::counter!("archival_worker_passes_total").increment(1);
}

/// Calls [`run_archival_pass`] every `interval` until `shutdown` flips to true
/// or its sender is dropped.
pub async fn archival_loop(
    manager: Arc<EventArchivalManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => run_archival_pass(&manager).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("archival worker stopped");
}

/// Asks a running [`archival_loop`] to stop. Returns false if it had already exited.
pub fn request_shutdown(shutdown: &watch::Sender<bool>) -> bool {
    if shutdown.send(true).is_err() {
        tracing::debug!("archival worker already stopped");
        return false;
    }
    true
}
