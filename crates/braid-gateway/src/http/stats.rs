//! Accounting endpoint — GET /stats
//!
//! Per-domain token aggregates, credential refresh metrics, and the
//! request-log row count.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let domains: Vec<Value> = state
        .tracker
        .snapshot()
        .into_iter()
        .map(|(domain, stats)| json!({"domain": domain, "stats": stats}))
        .collect();

    let stored_requests = match state.store.request_count() {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "request count query failed");
            0
        }
    };

    Json(json!({
        "domains": domains,
        "credential_refresh": state.credentials.metrics(),
        "stored_requests": stored_requests,
    }))
}
