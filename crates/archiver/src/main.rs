//! Archiver server entry point.

use std::error::Error;

use archiver::config::Config;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let state = archiver::build_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if config.archival_interval.is_zero() {
        tracing::info!("background archival disabled");
        None
    } else {
        tracing::info!(interval_secs = config.archival_interval.as_secs(), "starting archival worker");
        Some(tokio::spawn(archiver::worker::archival_loop(
            state.archival.clone(),
            config.archival_interval,
            shutdown_rx,
        )))
    };

    let app = archiver::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, archive_dir = %config.archive_dir.display(), "starting archiver");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    archiver::worker::request_shutdown(&shutdown_tx);
    if let Some(worker) = worker
        && let Err(e) = worker.await
    {
        tracing::error!(error = %e, "archival worker panicked");
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
