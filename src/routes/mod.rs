//! HTTP gateway.
//!
//! Each sibling module exports a subrouter over [`AppState`]; this gateway
//! merges them so `main.rs` never needs to know about individual endpoints.

use std::sync::Arc;

use axum::Router;

use crate::{FlushMetrics, MetricStore, RouterHandle, RuleSource};

mod health;
mod ingest;
mod rules;

// ---

/// Shared handles every endpoint may need.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetricStore>,
    pub router: RouterHandle,
    pub rules: Arc<dyn RuleSource>,
    pub metrics: FlushMetrics,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(ingest::router())
        .merge(rules::router())
        .merge(health::router())
        .with_state(state)
}
