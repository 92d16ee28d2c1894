//! Liveness endpoint — GET /health

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let breakers: Vec<Value> = state
        .breakers
        .states()
        .into_iter()
        .map(|(name, breaker_state)| json!({"upstream": name, "state": breaker_state}))
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": state.config.upstream.base_url,
        "breakers": breakers,
    }))
}
