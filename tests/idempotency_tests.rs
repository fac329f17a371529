mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{middleware, Router};
use idempotent_gateway::cache::{CacheProvider, InMemoryProvider};
use idempotent_gateway::config::{IdempotencySettings, KeyPolicyKind, LookupFailureMode};
use idempotent_gateway::error::{AppError, Result};
use idempotent_gateway::idempotency::{
    idempotency_middleware, CacheKey, IdempotencyCache, IdempotencyCoordinator,
};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

mock! {
    pub Provider {}

    #[async_trait]
    impl CacheProvider for Provider {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
        async fn delete(&self, key: &str) -> Result<()>;
        async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;
    }
}

fn backend_down() -> AppError {
    AppError::Internal(anyhow::anyhow!("backend unavailable"))
}

fn counting_handler(calls: Arc<AtomicUsize>, status: StatusCode) -> impl FnOnce(axum::extract::Request) -> std::future::Ready<Response> {
    move |_request| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready((status, r#"{"id":1}"#).into_response())
    }
}

#[tokio::test]
async fn test_requests_without_header_pass_through() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = common::coordinator(common::idempotency_cache(provider.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let request = Request::builder().method("POST").uri("/user").body(Body::empty()).unwrap();
        let response = coordinator
            .process(request, counting_handler(calls.clone(), StatusCode::CREATED))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(provider.is_empty());
}

#[tokio::test]
async fn test_unprotected_method_passes_through() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = common::coordinator(common::idempotency_cache(provider.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let request = Request::builder()
            .method("PUT")
            .uri("/user")
            .header(common::IDEMPOTENCY_HEADER, "k1")
            .body(Body::empty())
            .unwrap();
        coordinator
            .process(request, counting_handler(calls.clone(), StatusCode::OK))
            .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(provider.is_empty());
}

#[tokio::test]
async fn test_replay_skips_handler() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = common::coordinator(common::idempotency_cache(provider));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;
    let second = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.status(), second.status());
    assert_eq!(common::body_bytes(first).await, common::body_bytes(second).await);
}

#[tokio::test]
async fn test_failure_status_is_never_stored_and_lease_is_released() {
    let provider = Arc::new(InMemoryProvider::new());
    let cache = common::idempotency_cache(provider.clone());
    let coordinator = common::coordinator(cache.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(
            common::protected_request("/user", "k1"),
            counting_handler(calls.clone(), StatusCode::INTERNAL_SERVER_ERROR),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let key = CacheKey::new("k1", "POST /user");
    assert!(cache.get(&key).await.unwrap().is_none());
    assert!(provider.is_empty());

    coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_custom_cacheability_policy() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = common::coordinator(common::idempotency_cache(provider))
        .with_cacheability(Arc::new(|status: StatusCode| status == StatusCode::CREATED));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        coordinator
            .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::OK))
            .await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_requests_single_execution() {
    const REQUESTS: usize = 2000;

    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = Arc::new(common::coordinator(common::idempotency_cache(provider)));
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for _ in 0..REQUESTS {
        let coordinator = Arc::clone(&coordinator);
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        let tx = tx.clone();

        tokio::spawn(async move {
            let response = coordinator
                .process(common::protected_request("/user", "shared"), move |_request| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await.unwrap();
                    StatusCode::CREATED.into_response()
                })
                .await;
            tx.send(response.status()).unwrap();
        });
    }
    drop(tx);

    let mut conflicts = 0;
    for _ in 0..REQUESTS - 1 {
        let status = rx.recv().await.unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        conflicts += 1;
    }

    gate.add_permits(1);
    assert_eq!(rx.recv().await.unwrap(), StatusCode::CREATED);

    assert_eq!(conflicts, REQUESTS - 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.metrics().snapshot().conflicts, (REQUESTS - 1) as u64);
}

#[tokio::test]
async fn test_conflict_has_empty_body() {
    let provider = Arc::new(InMemoryProvider::new());
    let cache = common::idempotency_cache(provider);
    let coordinator = common::coordinator(cache.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    cache.lock(&CacheKey::new("k1", "POST /user")).await.unwrap();

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(common::body_bytes(response).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expired_lease_allows_fresh_attempt() {
    let provider = Arc::new(InMemoryProvider::new());
    let cache = Arc::new(
        IdempotencyCache::new(provider, "test", Duration::from_secs(60))
            .with_lock_ttl(Duration::from_millis(50)),
    );
    let coordinator = common::coordinator(cache.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    // A crashed attempt that never released its lease.
    cache.lock(&CacheKey::new("k1", "POST /user")).await.unwrap();

    let blocked = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;
    assert_eq!(blocked.status(), StatusCode::CONFLICT);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let fresh = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;
    assert_eq!(fresh.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_request_releases_lease() {
    let provider = Arc::new(InMemoryProvider::new());
    let cache = common::idempotency_cache(provider);
    let coordinator = Arc::new(common::coordinator(cache.clone()));
    let started = Arc::new(tokio::sync::Notify::new());

    let task = {
        let coordinator = Arc::clone(&coordinator);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            coordinator
                .process(common::protected_request("/user", "k1"), move |_request| async move {
                    started.notify_one();
                    std::future::pending::<Response>().await
                })
                .await
        })
    };

    started.notified().await;
    let key = CacheKey::new("k1", "POST /user");
    assert!(cache.lock(&key).await.unwrap_err().is_already_locked());

    task.abort();
    let _ = task.await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio_test::assert_ok!(cache.lock(&key).await);
}

#[tokio::test]
async fn test_panicking_handler_releases_lease() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = Arc::new(common::coordinator(common::idempotency_cache(provider)));
    let calls = Arc::new(AtomicUsize::new(0));

    let handler_calls = Arc::clone(&calls);
    let router = Router::new()
        .route(
            "/user",
            post(move || {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if calls.load(Ordering::SeqCst) == 1 {
                        panic!("handler crashed");
                    }
                    StatusCode::CREATED
                }
            }),
        )
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn_with_state(coordinator, idempotency_middleware));

    let first = router.clone().oneshot(common::protected_request("/user", "k1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let second = router.clone().oneshot(common::protected_request("/user", "k1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_lookup_failure_fails_open_by_default() {
    let mut provider = MockProvider::new();
    provider.expect_get().returning(|_| Err(backend_down()));
    provider.expect_set_if_absent().returning(|_, _, _| Ok(true));
    provider.expect_set().returning(|_, _, _| Ok(()));
    provider.expect_delete().times(1).returning(|_| Ok(()));

    let cache = Arc::new(IdempotencyCache::new(Arc::new(provider), "test", Duration::from_secs(60)));
    let coordinator = common::coordinator(cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(coordinator.metrics().snapshot().cache_errors >= 1);
}

#[tokio::test]
async fn test_lookup_failure_fails_closed_when_configured() {
    let mut provider = MockProvider::new();
    provider.expect_get().returning(|_| Err(backend_down()));
    provider.expect_set_if_absent().never();
    provider.expect_set().never();
    provider.expect_delete().never();

    let cache = Arc::new(IdempotencyCache::new(Arc::new(provider), "test", Duration::from_secs(60)));
    let coordinator = common::coordinator(cache).with_lookup_failure(LookupFailureMode::Closed);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_failure_still_delivers_response_and_unlocks() {
    let mut provider = MockProvider::new();
    provider.expect_get().returning(|_| Ok(None));
    provider.expect_set_if_absent().times(1).returning(|_, _, _| Ok(true));
    provider.expect_set().times(1).returning(|_, _, _| Err(backend_down()));
    provider.expect_delete().times(1).returning(|_| Ok(()));

    let cache = Arc::new(IdempotencyCache::new(Arc::new(provider), "test", Duration::from_secs(60)));
    let coordinator = common::coordinator(cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(common::body_bytes(response).await.as_ref(), br#"{"id":1}"#);
    assert_eq!(coordinator.metrics().snapshot().stored_responses, 0);
}

#[tokio::test]
async fn test_lock_backend_failure_executes_without_storing() {
    let mut provider = MockProvider::new();
    provider.expect_get().returning(|_| Ok(None));
    provider.expect_set_if_absent().returning(|_, _, _| Err(backend_down()));
    provider.expect_set().never();
    provider.expect_delete().never();

    let cache = Arc::new(IdempotencyCache::new(Arc::new(provider), "test", Duration::from_secs(60)));
    let coordinator = common::coordinator(cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.unprotected_responses, 1);
    assert_eq!(snapshot.skipped_responses, 0);
    assert_eq!(snapshot.stored_responses, 0);
}

#[tokio::test]
async fn test_undecodable_entry_is_a_miss_even_when_closed() {
    let provider = Arc::new(InMemoryProvider::new());
    let key = CacheKey::new("k1", "POST /user");
    provider
        .set(&key.storage_key("test"), b"{broken".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();

    let coordinator = common::coordinator(common::idempotency_cache(provider))
        .with_lookup_failure(LookupFailureMode::Closed);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = coordinator
        .process(common::protected_request("/user", "k1"), counting_handler(calls.clone(), StatusCode::CREATED))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.metrics().snapshot().stored_responses, 1);
}

#[tokio::test]
async fn test_replay_repeats_header_values_exactly() {
    let provider = Arc::new(InMemoryProvider::new());
    let coordinator = common::coordinator(common::idempotency_cache(provider));

    let handler = |_request: axum::extract::Request| async {
        let mut response = (StatusCode::CREATED, "created").into_response();
        let headers = response.headers_mut();
        headers.append("set-cookie", HeaderValue::from_static("session=abc; Path=/"));
        headers.append("set-cookie", HeaderValue::from_static("theme=dark"));
        headers.insert("x-order-ref", HeaderValue::from_bytes(b"ref-\xe9-42").unwrap());
        response
    };

    let first = coordinator.process(common::protected_request("/user", "k1"), handler).await;
    let replayed = coordinator.process(common::protected_request("/user", "k1"), handler).await;
    assert_eq!(coordinator.metrics().snapshot().replayed_requests, 1);

    for name in ["set-cookie", "x-order-ref", "content-type"] {
        let original: Vec<_> = first.headers().get_all(name).iter().collect();
        let repeated: Vec<_> = replayed.headers().get_all(name).iter().collect();
        assert!(!original.is_empty());
        assert_eq!(original, repeated, "header {}", name);
    }
    assert_eq!(first.headers().len(), replayed.headers().len());
    assert_eq!(common::body_bytes(first).await, common::body_bytes(replayed).await);
}

#[tokio::test]
async fn test_coordinator_from_settings() {
    let provider = Arc::new(InMemoryProvider::new());
    let settings = IdempotencySettings {
        header_name: "X-Idempotency-Key".to_string(),
        protected_methods: vec!["post".to_string(), "PUT".to_string()],
        key_policy: KeyPolicyKind::Hashed,
        scope_headers: vec!["X-Tenant-Id".to_string()],
        ..IdempotencySettings::default()
    };
    let coordinator =
        IdempotencyCoordinator::from_settings(common::idempotency_cache(provider), &settings).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let request = |tenant: &str| {
        Request::builder()
            .method("PUT")
            .uri("/user")
            .header("X-Idempotency-Key", "k1")
            .header("X-Tenant-Id", tenant)
            .body(Body::empty())
            .unwrap()
    };

    coordinator.process(request("a"), counting_handler(calls.clone(), StatusCode::OK)).await;
    coordinator.process(request("a"), counting_handler(calls.clone(), StatusCode::OK)).await;
    coordinator.process(request("b"), counting_handler(calls.clone(), StatusCode::OK)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(coordinator.header_name().as_str(), "x-idempotency-key");
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let provider = Arc::new(InMemoryProvider::new());
    let settings = IdempotencySettings {
        header_name: "not a header".to_string(),
        ..IdempotencySettings::default()
    };

    let result = IdempotencyCoordinator::from_settings(common::idempotency_cache(provider), &settings);
    assert!(matches!(result, Err(AppError::Validation(_))));
}
