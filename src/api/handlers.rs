//! API request handlers

use super::models::{
    EnsureResponse, HealthResponse, ModelInfo, PendingResponse, ReadinessResponse, WaitParams,
};
use super::routes::AppState;
use crate::error::ApiError;
use crate::models::descriptor::ModelId;
use crate::models::janitor::CleanupReport;
use crate::readiness::ReadinessSnapshot;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;

/// GET /health - Warden health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /models - Cache status of every catalog model
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    let locator = state.coordinator.locator().clone();
    let models = tokio::task::spawn_blocking(move || {
        ModelId::ALL
            .iter()
            .map(|id| ModelInfo::inspect(&locator, id.descriptor()))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| ApiError::Internal(anyhow::anyhow!("model inspection failed: {}", e)))?;

    Ok(Json(models))
}

/// GET /readiness - Current readiness state
pub async fn readiness(State(state): State<AppState>) -> Result<Json<ReadinessResponse>, ApiError> {
    let coordinator = state.coordinator.clone();
    let ready_now = tokio::task::spawn_blocking(move || coordinator.is_ready_now())
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("readiness probe failed: {}", e)))?;

    Ok(Json(ReadinessResponse {
        ready_now,
        snapshot: state.coordinator.snapshot(),
    }))
}

/// POST /readiness/wait - Wait for the current or next acquisition
///
/// Returns 202 with the current state when `timeout_secs` elapses first.
pub async fn wait_ready(
    State(state): State<AppState>,
    Query(params): Query<WaitParams>,
) -> Result<Response, ApiError> {
    let wait = state.coordinator.wait();

    let outcome = match params.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let body = PendingResponse {
                    pending: true,
                    snapshot: state.coordinator.snapshot(),
                };
                return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
            }
        },
        None => wait.await,
    };

    let ready = outcome.map_err(ApiError::Unavailable)?;
    Ok(Json(EnsureResponse::from(ready)).into_response())
}

/// POST /readiness/reset - Cancel any attempt and forget the last outcome
pub async fn reset(State(state): State<AppState>) -> Json<ReadinessSnapshot> {
    state.coordinator.reset();
    Json(state.coordinator.snapshot())
}

/// POST /models/{model}/ensure - Make a model ready, downloading if needed
pub async fn ensure_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<EnsureResponse>, ApiError> {
    let id: ModelId = model.parse()?;

    tracing::info!(model = %id, "Ensure requested via API");

    let ready = state
        .coordinator
        .request_ready(id.descriptor())
        .await
        .map_err(ApiError::Unavailable)?;

    Ok(Json(ready.into()))
}

/// POST /cache/cleanup - Reset and remove invalid cache entries
pub async fn cleanup_cache(State(state): State<AppState>) -> Json<CleanupReport> {
    let report = state.coordinator.clear_cache().await;
    Json(report)
}
