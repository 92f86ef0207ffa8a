//! Tollgate HTTP API server (Axum).
//!
//! Session lifecycle, quota and rate endpoints, memory context, and
//! server-sent-event delivery of streamed output.

pub mod error;
pub mod routes;
pub mod state;

use axum::Router;
use state::AppState;
use tg_core::TollgateConfig;

/// Build the application router with default configuration.
pub fn app() -> Router {
    app_with_state(AppState::new(TollgateConfig::default()))
}

/// Build the application router with a custom state.
pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::session_routes())
        .merge(routes::stream_routes())
        .with_state(state)
}
