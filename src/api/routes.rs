use axum::{
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::idempotency::{idempotency_middleware, IdempotencyCoordinator};
use crate::observability::{get_metrics, LatencyTimer};
use crate::services::UserService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub users: UserService,
    pub coordinator: Arc<IdempotencyCoordinator>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(users: UserService, coordinator: Arc<IdempotencyCoordinator>) -> Self {
        Self {
            users,
            coordinator,
            metrics_handle: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

async fn record_request_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let timer = LatencyTimer::new();

    let response = next.run(request).await;
    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());

    response
}

/// Creates the main API router with all routes.
///
/// Business routes sit behind the idempotency coordinator; a panic in a
/// handler is turned into a 500 before the coordinator sees it, so the
/// lease is released and nothing is cached.
pub fn create_router(state: AppState) -> Router {
    let coordinator = Arc::clone(&state.coordinator);

    Router::new()
        // User endpoints
        .route("/user", post(handlers::create_user))
        .route("/user/:id", get(handlers::get_user))
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn_with_state(coordinator, idempotency_middleware))
        // Operational endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .layer(middleware::from_fn(record_request_metrics))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
