pub mod sessions;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().merge(sessions::router())
}
