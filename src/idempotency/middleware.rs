use crate::config::{IdempotencySettings, KeyPolicyKind, LookupFailureMode};
use crate::error::{AppError, Result};
use crate::idempotency::cache::IdempotencyCache;
use crate::idempotency::capture::ResponseCapture;
use crate::idempotency::key::{CacheKey, HashedKeyPolicy, KeyPolicy, UriKeyPolicy};
use crate::idempotency::policy::{CacheabilityPolicy, SuccessRange};
use crate::observability::{get_metrics, mask_sensitive};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::header::HeaderName;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for coordinator outcomes.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub executed_requests: AtomicU64,
    pub stored_responses: AtomicU64,
    pub skipped_responses: AtomicU64,
    pub unprotected_responses: AtomicU64,
    pub cache_errors: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("replayed");
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("conflict");
    }

    pub fn record_executed(&self) {
        self.executed_requests.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("executed");
    }

    pub fn record_stored(&self) {
        self.stored_responses.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("stored");
    }

    pub fn record_skipped(&self) {
        self.skipped_responses.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("not_cacheable");
    }

    /// A response produced without holding the lease, so it was never stored.
    pub fn record_unprotected(&self) {
        self.unprotected_responses.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("unprotected");
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("cache_error");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            executed_requests: self.executed_requests.load(Ordering::Relaxed),
            stored_responses: self.stored_responses.load(Ordering::Relaxed),
            skipped_responses: self.skipped_responses.load(Ordering::Relaxed),
            unprotected_responses: self.unprotected_responses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub replayed_requests: u64,
    pub conflicts: u64,
    pub executed_requests: u64,
    pub stored_responses: u64,
    pub skipped_responses: u64,
    pub unprotected_responses: u64,
    pub cache_errors: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Holds the lease for one executing request.
///
/// Released explicitly on the normal path. If the request future is dropped
/// first (client gone, timeout, panic unwinding) the release is spawned onto
/// the runtime; without a runtime the lock TTL reclaims the key.
struct LeaseGuard {
    cache: Arc<IdempotencyCache>,
    key: Option<CacheKey>,
}

impl LeaseGuard {
    fn new(cache: Arc<IdempotencyCache>, key: CacheKey) -> Self {
        Self {
            cache,
            key: Some(key),
        }
    }

    async fn release(mut self) {
        if let Some(key) = self.key.take() {
            release_lease(&self.cache, &key).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = Arc::clone(&self.cache);
                handle.spawn(async move {
                    release_lease(&cache, &key).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    operation = %key.operation(),
                    "No runtime to release lease; it will expire with the lock TTL"
                );
            }
        }
    }
}

async fn release_lease(cache: &IdempotencyCache, key: &CacheKey) {
    if let Err(e) = cache.unlock(key).await {
        tracing::error!(
            error = %e,
            operation = %key.operation(),
            "Failed to release idempotency lease"
        );
    }
}

/// Runs protected requests at most once per idempotency key.
///
/// Requests whose method is not protected, or that carry no idempotency
/// header, pass straight through. Otherwise a stored response is replayed;
/// failing that, the request takes the key's lease (or gets 409 if another
/// attempt holds it), runs downstream, and a cacheable result is stored
/// before the lease is released.
pub struct IdempotencyCoordinator {
    cache: Arc<IdempotencyCache>,
    header_name: HeaderName,
    key_policy: Arc<dyn KeyPolicy>,
    cacheability: Arc<dyn CacheabilityPolicy>,
    protected_methods: Vec<Method>,
    lookup_failure: LookupFailureMode,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyCoordinator {
    pub fn new(cache: Arc<IdempotencyCache>, header_name: HeaderName) -> Self {
        Self {
            cache,
            key_policy: Arc::new(UriKeyPolicy::new(header_name.clone())),
            header_name,
            cacheability: Arc::new(SuccessRange),
            protected_methods: vec![Method::POST],
            lookup_failure: LookupFailureMode::Open,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    /// Builds a coordinator from configuration.
    pub fn from_settings(cache: Arc<IdempotencyCache>, settings: &IdempotencySettings) -> Result<Self> {
        let header_name = parse_header_name(&settings.header_name)?;

        let protected_methods = settings
            .protected_methods
            .iter()
            .map(|method| {
                Method::from_bytes(method.trim().to_uppercase().as_bytes())
                    .map_err(|_| AppError::Validation(format!("invalid protected method '{}'", method)))
            })
            .collect::<Result<Vec<_>>>()?;

        let key_policy: Arc<dyn KeyPolicy> = match settings.key_policy {
            KeyPolicyKind::Uri => Arc::new(UriKeyPolicy::new(header_name.clone())),
            KeyPolicyKind::Hashed => {
                let scope_headers = settings
                    .scope_headers
                    .iter()
                    .map(|name| parse_header_name(name))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(HashedKeyPolicy::new(header_name.clone(), scope_headers))
            }
        };

        Ok(Self::new(cache, header_name)
            .with_key_policy(key_policy)
            .with_protected_methods(protected_methods)
            .with_lookup_failure(settings.lookup_failure))
    }

    pub fn with_key_policy(mut self, key_policy: Arc<dyn KeyPolicy>) -> Self {
        self.key_policy = key_policy;
        self
    }

    pub fn with_cacheability(mut self, cacheability: Arc<dyn CacheabilityPolicy>) -> Self {
        self.cacheability = cacheability;
        self
    }

    pub fn with_protected_methods(mut self, methods: Vec<Method>) -> Self {
        self.protected_methods = methods;
        self
    }

    pub fn with_lookup_failure(mut self, mode: LookupFailureMode) -> Self {
        self.lookup_failure = mode;
        self
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cache(&self) -> Arc<IdempotencyCache> {
        Arc::clone(&self.cache)
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    fn is_protected(&self, method: &Method) -> bool {
        self.protected_methods.contains(method)
    }

    /// Runs `request` through the idempotency protocol, invoking `downstream`
    /// at most once.
    pub async fn process<F, Fut>(&self, request: Request, downstream: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if !self.is_protected(request.method()) || !request.headers().contains_key(&self.header_name) {
            return downstream(request).await;
        }

        let (parts, body) = request.into_parts();
        let Some(key) = self.key_policy.derive(&parts) else {
            return downstream(Request::from_parts(parts, body)).await;
        };

        self.metrics.record_request();
        let token = mask_sensitive(key.token(), 2);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                self.metrics.record_replay();
                tracing::debug!(token = %token, operation = %key.operation(), "Replaying cached response");
                return cached.to_response();
            }
            Ok(None) => {}
            Err(e) if e.is_backend() => {
                self.metrics.record_cache_error();
                tracing::warn!(error = %e, token = %token, "Idempotency cache read failed");
                if self.lookup_failure == LookupFailureMode::Closed {
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
            }
            // An undecodable entry has already been evicted; the backend is healthy.
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(error = %e, token = %token, "Treating undecodable cached response as a miss");
            }
        }

        let mut lease = match self.cache.lock(&key).await {
            Ok(()) => Some(LeaseGuard::new(Arc::clone(&self.cache), key.clone())),
            Err(AppError::AlreadyLocked) => {
                self.metrics.record_conflict();
                tracing::info!(token = %token, operation = %key.operation(), "Concurrent request holds the idempotency lease");
                return StatusCode::CONFLICT.into_response();
            }
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(error = %e, token = %token, "Failed to acquire idempotency lease");
                if self.lookup_failure == LookupFailureMode::Closed {
                    return StatusCode::SERVICE_UNAVAILABLE.into_response();
                }
                None
            }
        };

        // A request holding the lease may have just finished and stored its
        // response between our lookup and our lock.
        if lease.is_some() {
            if let Ok(Some(cached)) = self.cache.get(&key).await {
                self.metrics.record_replay();
                if let Some(lease) = lease.take() {
                    lease.release().await;
                }
                return cached.to_response();
            }
        }

        self.metrics.record_executed();
        let response = downstream(Request::from_parts(parts, body)).await;

        let response = match ResponseCapture::capture(response).await {
            Ok(capture) => {
                if lease.is_none() {
                    self.metrics.record_unprotected();
                } else if self.cacheability.is_cacheable(capture.status()) {
                    let cached = capture.to_cached_response(&capture.content_type());
                    match self.cache.set(&key, &cached).await {
                        Ok(()) => self.metrics.record_stored(),
                        Err(e) => {
                            self.metrics.record_cache_error();
                            tracing::warn!(error = %e, token = %token, "Failed to store idempotent response");
                        }
                    }
                } else {
                    self.metrics.record_skipped();
                }
                capture.into_response()
            }
            Err(e) => {
                tracing::error!(error = %e, token = %token, "Downstream response failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };

        if let Some(lease) = lease {
            lease.release().await;
        }

        response
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| AppError::Validation(format!("invalid header name '{}'", name)))
}

/// Axum middleware entry point for [`IdempotencyCoordinator`].
///
/// ```ignore
/// let app = Router::new()
///     .route("/user", post(create_user))
///     .layer(middleware::from_fn_with_state(coordinator, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(coordinator): State<Arc<IdempotencyCoordinator>>,
    request: Request,
    next: Next,
) -> Response {
    coordinator.process(request, |request| next.run(request)).await
}
