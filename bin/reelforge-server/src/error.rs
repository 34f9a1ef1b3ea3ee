//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON-body HTTP
//! response with an appropriate status code.
//!
//! Store and bookkeeping errors are logged with full detail but only a
//! generic message is returned to the caller.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reelforge_core::RuntimeError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the reelforge-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the orchestration core.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServerError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Runtime(e) => match e {
                RuntimeError::TaskNotFound { .. } | RuntimeError::RunNotFound { .. } => {
                    (StatusCode::NOT_FOUND, e.to_string())
                }
                RuntimeError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                RuntimeError::InvalidTransition { .. } | RuntimeError::NotSubmitted { .. } => {
                    (StatusCode::CONFLICT, e.to_string())
                }
                RuntimeError::Configuration(_) => {
                    error!(error = %e, "orchestrator misconfigured");
                    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                }
                RuntimeError::Shutdown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down".to_owned())
                }
                _ => {
                    error!(error = %e, "orchestration error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = self.status_and_message();
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
