//! Gateway errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use turnkeep_core::error::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("A turn is already running for this session (job {job_id})")]
    SessionBusy { job_id: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Missing x-user-id header")]
    MissingUser,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Refusing to bind to {0}; set gateway.allow_public_bind to allow it")]
    PublicBind(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SessionBusy { .. } => StatusCode::CONFLICT,
            Self::JobNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::MissingUser => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PublicBind(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let job_id = match &self {
            Self::SessionBusy { job_id } => Some(job_id.clone()),
            _ => None,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                job_id,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let busy = GatewayError::SessionBusy { job_id: "j1".into() };
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert!(busy.to_string().contains("j1"));
        assert_eq!(GatewayError::MissingUser.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::Store(StoreError::Storage("disk full".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
