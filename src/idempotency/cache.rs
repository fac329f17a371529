use crate::cache::CacheProvider;
use crate::error::{AppError, Result};
use crate::idempotency::key::CacheKey;
use crate::observability::{get_metrics, LatencyTimer};
use axum::body::Body;
use axum::response::Response;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Value written under a lock slot. Only the slot's presence matters.
const LOCK_SENTINEL: &[u8] = b"LOCK";

/// A captured response, as stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    /// Header name to its raw values, in the order they were written.
    #[serde(with = "base64_headers")]
    pub headers: BTreeMap<String, Vec<Vec<u8>>>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Snapshots `headers` by value.
    pub fn new(status: StatusCode, content_type: impl Into<String>, headers: &HeaderMap, body: Vec<u8>) -> Self {
        let mut multimap: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        for (name, value) in headers {
            multimap
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.as_bytes().to_vec());
        }

        Self {
            status: status.as_u16(),
            content_type: content_type.into(),
            headers: multimap,
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let response: CachedResponse = serde_json::from_slice(bytes)?;
        if StatusCode::from_u16(response.status).is_err() {
            return Err(AppError::Serialization(serde::de::Error::custom(format!(
                "cached response has invalid status {}",
                response.status
            ))));
        }
        Ok(response)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Rebuilds the header map. Entries that are no longer valid header
    /// names or values are dropped.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = %name, "Dropping invalid cached header name");
                continue;
            };
            for value in values {
                match HeaderValue::from_bytes(value) {
                    Ok(value) => {
                        map.append(name.clone(), value);
                    }
                    Err(_) => tracing::warn!(header = %name, "Dropping invalid cached header value"),
                }
            }
        }

        if !map.contains_key(CONTENT_TYPE) && !self.content_type.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.content_type) {
                map.insert(CONTENT_TYPE, value);
            }
        }
        map
    }

    /// Builds the response sent to a client whose request is being replayed.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status_code();
        *response.headers_mut() = self.header_map();
        response
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_headers {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        headers: &BTreeMap<String, Vec<Vec<u8>>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, Vec<String>> = headers
            .iter()
            .map(|(name, values)| {
                (
                    name.as_str(),
                    values.iter().map(|value| STANDARD.encode(value)).collect(),
                )
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<Vec<u8>>>, D::Error> {
        let encoded = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(|value| STANDARD.decode(value).map_err(serde::de::Error::custom))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((name, values))
            })
            .collect()
    }
}

/// Idempotency state on top of a [`CacheProvider`]: cached responses under
/// the response slot of a key, and a lease under its lock slot.
pub struct IdempotencyCache {
    provider: Arc<dyn CacheProvider>,
    key_prefix: String,
    ttl: Duration,
    lock_ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(provider: Arc<dyn CacheProvider>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            provider,
            key_prefix: key_prefix.into(),
            ttl,
            lock_ttl: ttl,
        }
    }

    /// Bounds how long a lease survives when it is never released.
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Looks up the cached response for `key`.
    ///
    /// An undecodable payload is evicted and reported as an error so the
    /// caller can treat it like any other failed read.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
        let slot = key.storage_key(&self.key_prefix);
        let timer = LatencyTimer::new();

        let result = self.provider.get(&slot).await;
        get_metrics().record_cache_operation("get", timer.elapsed_ms(), result.is_ok());

        let Some(bytes) = result? else {
            return Ok(None);
        };

        match CachedResponse::from_bytes(&bytes) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                tracing::warn!(error = %e, "Evicting undecodable cached response");
                if let Err(delete_err) = self.provider.delete(&slot).await {
                    tracing::warn!(error = %delete_err, "Failed to evict cached response");
                }
                Err(e)
            }
        }
    }

    /// Stores `response` for `key`, replacing any previous entry.
    pub async fn set(&self, key: &CacheKey, response: &CachedResponse) -> Result<()> {
        let bytes = response.to_bytes()?;
        let timer = LatencyTimer::new();

        let result = self
            .provider
            .set(&key.storage_key(&self.key_prefix), bytes, self.ttl)
            .await;
        get_metrics().record_cache_operation("set", timer.elapsed_ms(), result.is_ok());

        result
    }

    /// Acquires the lease for `key`, failing with [`AppError::AlreadyLocked`]
    /// while another attempt holds it.
    pub async fn lock(&self, key: &CacheKey) -> Result<()> {
        let slot = key.lock_key().storage_key(&self.key_prefix);
        let timer = LatencyTimer::new();

        let result = self
            .provider
            .set_if_absent(&slot, LOCK_SENTINEL.to_vec(), self.lock_ttl)
            .await;
        get_metrics().record_cache_operation("lock", timer.elapsed_ms(), result.is_ok());

        if result? {
            Ok(())
        } else {
            Err(AppError::AlreadyLocked)
        }
    }

    /// Releases the lease for `key`. Releasing an absent lease is a no-op.
    pub async fn unlock(&self, key: &CacheKey) -> Result<()> {
        let timer = LatencyTimer::new();

        let result = self
            .provider
            .delete(&key.lock_key().storage_key(&self.key_prefix))
            .await;
        get_metrics().record_cache_operation("unlock", timer.elapsed_ms(), result.is_ok());

        result
    }
}
