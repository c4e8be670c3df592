use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use snapshot_store::CorruptSnapshot;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct VerifyResponse {
    pub healthy: bool,
    pub corrupt: Vec<CorruptSnapshot>,
}

/// GET /snapshots/verify: rehashes every stored snapshot.
#[tracing::instrument(skip(state))]
pub async fn verify(State(state): State<Arc<AppState>>) -> Result<Json<VerifyResponse>, ApiError> {
    let corrupt = state.snapshots.verify_integrity().await?;
    if !corrupt.is_empty() {
        tracing::warn!(corrupt = corrupt.len(), "snapshot integrity check found mismatches");
    }
    Ok(Json(VerifyResponse {
        healthy: corrupt.is_empty(),
        corrupt,
    }))
}
