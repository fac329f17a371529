#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use idempotent_gateway::api::{create_router, AppState};
use idempotent_gateway::cache::InMemoryProvider;
use idempotent_gateway::idempotency::{IdempotencyCache, IdempotencyCoordinator};
use idempotent_gateway::repositories::InMemoryUserRepository;
use idempotent_gateway::services::UserService;
use std::sync::Arc;
use std::time::Duration;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Id";

pub struct TestApp {
    pub router: Router,
    pub coordinator: Arc<IdempotencyCoordinator>,
    pub users: Arc<InMemoryUserRepository>,
    pub provider: Arc<InMemoryProvider>,
}

pub fn idempotency_cache(provider: Arc<InMemoryProvider>) -> Arc<IdempotencyCache> {
    Arc::new(
        IdempotencyCache::new(provider, "test", Duration::from_secs(60))
            .with_lock_ttl(Duration::from_secs(5)),
    )
}

pub fn coordinator(cache: Arc<IdempotencyCache>) -> IdempotencyCoordinator {
    IdempotencyCoordinator::new(cache, IDEMPOTENCY_HEADER.parse().unwrap())
}

pub fn test_app() -> TestApp {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = Arc::new(coordinator(idempotency_cache(provider.clone())));
    let users = Arc::new(InMemoryUserRepository::new());

    let state = AppState::new(UserService::new(users.clone()), coordinator.clone());

    TestApp {
        router: create_router(state),
        coordinator,
        users,
        provider,
    }
}

pub fn post_user(idempotency_id: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/user")
        .header("content-type", "application/json");
    if let Some(id) = idempotency_id {
        builder = builder.header(IDEMPOTENCY_HEADER, id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn protected_request(uri: &str, idempotency_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(IDEMPOTENCY_HEADER, idempotency_id)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}
