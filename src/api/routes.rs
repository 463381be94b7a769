//! API route definitions

use crate::readiness::ReadinessCoordinator;
use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: ReadinessCoordinator,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/models", get(handlers::list_models))
        // Readiness
        .route("/readiness", get(handlers::readiness))
        .route("/readiness/wait", post(handlers::wait_ready))
        .route("/readiness/reset", post(handlers::reset))
        .route("/models/{model}/ensure", post(handlers::ensure_model))
        // Maintenance
        .route("/cache/cleanup", post(handlers::cleanup_cache))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
