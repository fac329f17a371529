use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::responses::{ApiResponse, ErrorResponse};

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another attempt already holds the lease for this key.
    #[error("already locked")]
    AlreadyLocked,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Returns true for the expected concurrent-collision outcome.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, AppError::AlreadyLocked)
    }

    /// Returns true for storage backend failures (as opposed to payload problems).
    pub fn is_backend(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::Database(_) | AppError::Internal(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyLocked => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyLocked => "CONFLICT",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::Validation(msg) | AppError::NotFound(msg) => msg.clone(),
            AppError::AlreadyLocked => "Request is currently being processed. Please retry later.".to_string(),
            other => {
                tracing::error!(error = %other, "Request failed");
                "An internal error occurred".to_string()
            }
        };

        (
            status,
            Json(ApiResponse::<()>::error(ErrorResponse::new(self.code(), message))),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
