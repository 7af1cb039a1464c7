//! Request error taxonomy shared by all handlers.
//!
//! Validation, authorization, not-found, and conflict errors surface directly
//! to the caller with a stable message. Document-store failures in the
//! critical path map to Internal; failures of best-effort collaborators
//! (push, relay) are handled at their call sites and never reach here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed input (400).
    #[error("{0}")]
    Validation(String),

    /// Principal is not a participant or lacks the required role (403).
    #[error("{0}")]
    Forbidden(String),

    /// Resource missing, or a state-mismatched request such as accepting a
    /// conversation that is no longer `requested` (404).
    #[error("{0}")]
    NotFound(String),

    /// Duplicate action, e.g. initiating a call while already in one (409).
    /// `existing_id` carries the id of the record that won the race.
    #[error("{message}")]
    Conflict {
        message: String,
        existing_id: Option<String>,
    },

    /// Upstream dependency failed in the critical path (502).
    #[error("{0}")]
    Upstream(String),

    /// Anything that should never surface detail to the caller (500).
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>, existing_id: Option<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
            existing_id,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::Conflict {
                message,
                existing_id: Some(id),
            } => json!({ "error": message, "existing_call_id": id }),
            other => json!({ "error": other.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("resource not found".into()),
            other => {
                tracing::error!(error = %other, "database error");
                Self::Internal
            }
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = %err, "blocking task failed");
        Self::Internal
    }
}
