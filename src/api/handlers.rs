use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::requests::CreateUserRequest;
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, UserResponse, ValidationErrorDetail,
};
use crate::error::AppError;

use super::routes::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::<()>::error(ErrorResponse::new(code, message))))
}

fn service_error(err: AppError, context: &str) -> ApiError {
    match err {
        AppError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
        AppError::Validation(msg) => api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
        e => {
            tracing::error!("Failed to {}: {}", context, e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred",
            )
        }
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let idempotency = state.coordinator.metrics().snapshot();
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        replay_rate: idempotency.replay_rate(),
        idempotency,
    };

    Json(ApiResponse::success(response))
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ============================================================================
// User Handlers
// ============================================================================

/// Create a new user.
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", rejection.body_text())
    })?;

    if let Err(errors) = request.validate() {
        let details: Vec<ValidationErrorDetail> = errors
            .iter()
            .map(|e| ValidationErrorDetail {
                field: e.field.clone(),
                message: e.message.clone(),
            })
            .collect();

        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                    .with_details(details),
            )),
        ));
    }

    let user = state
        .users
        .create_user(request.into())
        .await
        .map_err(|e| service_error(e, "create user"))?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// Get user by id.
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .users
        .find_by_id(id)
        .await
        .map_err(|e| service_error(e, "get user"))?;

    Ok(Json(UserResponse::from(user)))
}
