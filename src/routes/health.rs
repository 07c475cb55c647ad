// src/routes/health.rs
//! Liveness and readiness endpoints.
//!
//! - `GET /health` checks that the metrics store answers a round trip.
//! - `GET /ready` reports the router's worker count and degraded rules.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    workers: usize,
    degraded_rules: Vec<i64>,
}

/// Handle `GET /health`.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    // ---
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                database: "connected",
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    database: "disconnected",
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Handle `GET /ready`. Degraded rules still report 200 since the other
/// rules keep aggregating.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    // ---
    let status = state.router.status();
    let (code, label) = if !status.running {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    } else if status.degraded_rules.is_empty() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::OK, "degraded")
    };

    (
        code,
        Json(ReadyResponse {
            status: label,
            workers: status.workers,
            degraded_rules: status.degraded_rules,
        }),
    )
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
}
