//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body of the form
//! `{"status": <code>, "message": "..."}`.
//!
//! **Security note:** Internal errors (Upstream, Database) are logged with full
//! detail but only a generic message is returned to the caller so that
//! file paths, SQL, or other implementation details never leak to clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use envhub_core::{CoreError, ValidationError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the envhub-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the container runtime or the delegated build service.
    #[error("upstream error: {0}")]
    Upstream(#[from] CoreError),

    /// Propagated from the SQLite store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or wrong API token. Rendered as 404 so the API surface is not
    /// advertised to unauthenticated callers.
    #[error("unauthorized")]
    Unauthorized,

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ServerError {
    fn from(e: ValidationError) -> Self {
        if e.is_client_error() {
            ServerError::BadRequest(e.to_string())
        } else {
            ServerError::Internal(e.to_string())
        }
    }
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) | ServerError::Unauthorized => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Upstream(_) | ServerError::Database(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let client_message = match &self {
            // Client-facing errors: expose the message directly.
            ServerError::NotFound(m) | ServerError::BadRequest(m) => m.clone(),
            ServerError::Unauthorized => "Not Found".to_owned(),

            // Internal errors: log the full detail, keep the response generic.
            ServerError::Upstream(e) => {
                error!(error = %e, "container runtime error");
                match e {
                    CoreError::RuntimeUnavailable(_) => "container runtime unavailable".to_owned(),
                    CoreError::Delegated(_) => "build service unavailable".to_owned(),
                    _ => "container runtime error".to_owned(),
                }
            }
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                "internal server error".to_owned()
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                "internal server error".to_owned()
            }
        };
        (
            status,
            Json(json!({ "status": status.as_u16(), "message": client_message })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
