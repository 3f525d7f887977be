//! Plain HTTP handlers.

use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_connections: usize,
}

/// Liveness endpoint; reports how many upstream sockets are registered.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: state.registry.len().await,
    })
}
