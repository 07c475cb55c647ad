//! `POST /rules/reload`: force an immediate rule snapshot refresh.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};

use super::AppState;
use crate::rules;

async fn reload(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    // ---
    match rules::reload(state.rules.as_ref(), &state.router).await {
        Ok(count) => {
            tracing::info!(rules = count, "Reloaded rules on request");
            (StatusCode::OK, Json(json!({ "rules": count })))
        }
        Err(e) => {
            tracing::error!(error = %e, "Rule reload failed, keeping previous snapshot");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("{e:#}") })),
            )
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/rules/reload", post(reload))
}
