//! `POST /ingest`: the sample feed.
//!
//! Accepts one message or an array of messages. Each message is parsed on
//! its own; malformed ones are logged, counted and skipped without failing
//! the request.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::AppState;
use crate::parse_message;

#[derive(Debug, Default, Serialize)]
struct IngestResponse {
    accepted: usize,
    rejected: usize,
}

async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<IngestResponse>), (StatusCode, String)> {
    // ---
    let received_at = Utc::now();
    let messages = match body {
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut counts = IngestResponse::default();
    for message in messages {
        let sample = match parse_message(message, received_at) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Rejecting malformed sample");
                state.metrics.record_rejected_sample();
                counts.rejected += 1;
                continue;
            }
        };

        if let Err(e) = state.router.submit(sample).await {
            tracing::error!(error = %e, "Router unavailable");
            return Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()));
        }
        counts.accepted += 1;
    }

    tracing::debug!(
        accepted = counts.accepted,
        rejected = counts.rejected,
        "POST /ingest"
    );
    Ok((StatusCode::ACCEPTED, Json(counts)))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ingest", post(ingest))
}
