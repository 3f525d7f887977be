//! Axum Router Configuration
//!
//! WebSocket upgrades are accepted on both `/` and `/ws`; `/healthz` reports
//! the number of live upstream connections.

use crate::{handlers, state::AppState, ws::ws_handler};
use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(handlers::healthz))
        .with_state(app_state)
        .layer(cors)
}
