use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Configuration(String),

    #[error("AI service error ({status})")]
    Upstream { status: u16, details: String },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Upstream { status, body } => RelayError::Upstream {
                status,
                details: body,
            },
            ProviderError::Timeout(limit) => RelayError::Upstream {
                status: 504,
                details: format!("No response from upstream within {:?}", limit),
            },
            other => RelayError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            RelayError::Configuration(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response(),
            RelayError::Upstream { status, details } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (
                    status,
                    Json(json!({ "error": "AI service error", "details": details })),
                )
                    .into_response()
            }
            RelayError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error", "message": message })),
            )
                .into_response(),
        }
    }
}
