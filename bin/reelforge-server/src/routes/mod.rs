//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - HTTP tracing layer
//! - Health / heartbeat route
//! - `/v1` session command and snapshot routes

mod health;
mod v1;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
