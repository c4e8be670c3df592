//! Manual triggers and inspection for the archival tiers.

use std::sync::Arc;

use archival::{ArchivalRunReport, ArchivalStatistics, CleanupReport, MigrationReport};
use axum::Json;
use axum::extract::{Path, Query, State};
use common::AggregateId;
use event_store::{EventEnvelope, Version};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Restored aggregates are migrated back to warm after this many restores.
pub const DEFAULT_MIN_ACCESSES: u64 = 3;

#[derive(Debug, Default, Deserialize)]
pub struct HotParams {
    pub older_than_hours: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WarmParams {
    pub older_than_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MigrateParams {
    pub min_accesses: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreParams {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Serialize)]
pub struct RestoreResponse {
    pub aggregate_id: String,
    pub count: usize,
    pub events: Vec<EventEnvelope>,
}

/// GET /archival/stats
#[tracing::instrument(skip(state))]
pub async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ArchivalStatistics>, ApiError> {
    Ok(Json(state.archival.get_archival_statistics().await?))
}

/// POST /archival/hot: moves idle aggregates to the warm tier.
#[tracing::instrument(skip(state))]
pub async fn archive_hot(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HotParams>,
) -> Result<Json<ArchivalRunReport>, ApiError> {
    let hours = params
        .older_than_hours
        .unwrap_or(state.archival.config().hot_retention_hours);
    Ok(Json(state.archival.archive_hot_events(hours).await?))
}

/// POST /archival/warm: moves expired partitions to cold storage.
#[tracing::instrument(skip(state))]
pub async fn archive_warm(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WarmParams>,
) -> Result<Json<ArchivalRunReport>, ApiError> {
    let days = params
        .older_than_days
        .unwrap_or(state.archival.config().warm_retention_days);
    Ok(Json(state.archival.archive_warm_events(days).await?))
}

/// POST /archival/cleanup: deletes cold archives that no longer decode.
#[tracing::instrument(skip(state))]
pub async fn cleanup(State(state): State<Arc<AppState>>) -> Result<Json<CleanupReport>, ApiError> {
    Ok(Json(state.archival.cleanup_corrupted_archives().await?))
}

/// POST /archival/migrate: moves frequently restored aggregates back to warm.
#[tracing::instrument(skip(state))]
pub async fn migrate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MigrateParams>,
) -> Result<Json<MigrationReport>, ApiError> {
    let min_accesses = params.min_accesses.unwrap_or(DEFAULT_MIN_ACCESSES);
    Ok(Json(
        state.archival.migrate_frequently_accessed(min_accesses).await?,
    ))
}

/// GET /archival/restore/{id}: reads an aggregate's events from cold storage.
#[tracing::instrument(skip(state))]
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<RestoreParams>,
) -> Result<Json<RestoreResponse>, ApiError> {
    let aggregate_id: AggregateId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    let version = |v: Option<i64>| -> Result<Option<Version>, ApiError> {
        match v {
            Some(v) if v < 1 => Err(ApiError::BadRequest(format!(
                "versions start at 1, got {v}"
            ))),
            v => Ok(v.map(Version::new)),
        }
    };
    let (from, to) = (version(params.from)?, version(params.to)?);

    let events = state
        .archival
        .restore_from_cold(aggregate_id, from, to)
        .await?;

    Ok(Json(RestoreResponse {
        aggregate_id: aggregate_id.to_string(),
        count: events.len(),
        events,
    }))
}
