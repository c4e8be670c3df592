//! Operations server for the tiered event store.
//!
//! Exposes archival triggers, cold restores and snapshot integrity checks
//! over HTTP, with structured logging (tracing) and Prometheus metrics, and
//! runs archival passes in the background.

pub mod config;
pub mod error;
pub mod routes;
pub mod worker;

use std::sync::Arc;

use archival::{ArchivalError, EventArchivalManager, FilesystemColdStorage};
use axum::Router;
use axum::routing::{get, post};
use event_store::{HotTier, InMemoryEventStore, PostgresEventStore, WarmTier};
use metrics_exporter_prometheus::PrometheusHandle;
use snapshot_store::{InMemorySnapshotStore, PostgresSnapshotStore, SnapshotStore};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub archival: Arc<EventArchivalManager>,
    pub snapshots: Arc<dyn SnapshotStore>,
    /// `"postgres"` or `"memory"`.
    pub warm_backend: &'static str,
}

/// Failures while wiring the stores at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Archival setup failed: {0}")]
    Archival(#[from] ArchivalError),
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health))
        .route("/archival/stats", get(routes::archival::stats))
        .route("/archival/hot", post(routes::archival::archive_hot))
        .route("/archival/warm", post(routes::archival::archive_warm))
        .route("/archival/cleanup", post(routes::archival::cleanup))
        .route("/archival/migrate", post(routes::archival::migrate))
        .route("/archival/restore/{id}", get(routes::archival::restore))
        .route("/snapshots/verify", get(routes::snapshots::verify))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the stores named by `config`.
///
/// With a `DATABASE_URL` the warm tier and snapshots live in Postgres;
/// otherwise every tier but cold is process-local.
pub async fn build_state(config: &Config) -> Result<Arc<AppState>, StartupError> {
    let hot: Arc<dyn HotTier> = Arc::new(InMemoryEventStore::new());

    let (warm, snapshots, warm_backend) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let events = PostgresEventStore::new(pool.clone());
            events.run_migrations().await?;
            tracing::info!("using postgres warm tier");

            let warm: Arc<dyn WarmTier> = Arc::new(events);
            let snapshots: Arc<dyn SnapshotStore> = Arc::new(PostgresSnapshotStore::new(pool));
            (warm, snapshots, "postgres")
        }
        None => {
            tracing::warn!("DATABASE_URL not set, warm tier is in memory");
            let warm: Arc<dyn WarmTier> = Arc::new(InMemoryEventStore::new());
            let snapshots: Arc<dyn SnapshotStore> = Arc::new(InMemorySnapshotStore::new());
            (warm, snapshots, "memory")
        }
    };

    let cold = Arc::new(FilesystemColdStorage::new(config.archive_dir.clone()));
    let archival = EventArchivalManager::new(hot, warm, cold, config.archival())?;

    Ok(Arc::new(AppState {
        archival: Arc::new(archival),
        snapshots,
        warm_backend,
    }))
}
