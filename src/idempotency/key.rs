use http::header::{HeaderMap, HeaderName};
use http::request::Parts;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies one logical operation attempt: the client's idempotency token
/// paired with the operation it was sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    token: String,
    operation: String,
}

impl CacheKey {
    pub fn new(token: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            operation: operation.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Key of the in-flight lease for this operation.
    pub fn lock_key(&self) -> LockKey {
        LockKey(self.clone())
    }

    /// Length-prefixing the token keeps the encoding injective even when the
    /// token itself contains the separator.
    fn encoded(&self) -> String {
        format!("{}:{}|{}", self.token.len(), self.token, self.operation)
    }

    /// Storage slot holding the cached response.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}:response:{}", prefix, self.encoded())
    }
}

/// Namespaced twin of a [`CacheKey`] addressing the lease slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(CacheKey);

impl LockKey {
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}:lock:{}", prefix, self.0.encoded())
    }
}

/// Returns the trimmed idempotency token carried by `headers`, if any.
pub fn idempotency_token<'a>(headers: &'a HeaderMap, header: &HeaderName) -> Option<&'a str> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Maps a request to the key its idempotency state is stored under.
///
/// Changing the policy of a running deployment orphans every entry derived
/// under the previous one; lookups behave as a cold cache until they expire.
pub trait KeyPolicy: Send + Sync {
    /// Returns `None` when the request carries no usable idempotency token.
    fn derive(&self, parts: &Parts) -> Option<CacheKey>;
}

/// Default policy: the token paired with the request method and full URI.
#[derive(Debug, Clone)]
pub struct UriKeyPolicy {
    header: HeaderName,
}

impl UriKeyPolicy {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl KeyPolicy for UriKeyPolicy {
    fn derive(&self, parts: &Parts) -> Option<CacheKey> {
        let token = idempotency_token(&parts.headers, &self.header)?;
        Some(CacheKey::new(token, format!("{} {}", parts.method, parts.uri)))
    }
}

/// Folds the method, URI and a set of scoping headers (a tenant id, say) into
/// a SHA-256 digest used as the operation component.
#[derive(Debug, Clone)]
pub struct HashedKeyPolicy {
    header: HeaderName,
    scope_headers: Vec<HeaderName>,
}

impl HashedKeyPolicy {
    pub fn new(header: HeaderName, scope_headers: Vec<HeaderName>) -> Self {
        Self {
            header,
            scope_headers,
        }
    }

    fn digest(&self, parts: &Parts) -> String {
        let mut hasher = Sha256::new();

        let uri = parts.uri.to_string();
        hasher.update(parts.method.as_str().as_bytes());
        hasher.update(format!("|{}:", uri.len()).as_bytes());
        hasher.update(uri.as_bytes());

        // Every value is length-prefixed so no split of the bytes collides.
        for name in &self.scope_headers {
            hasher.update(b"|");
            hasher.update(name.as_str().as_bytes());
            hasher.update(b"=");
            for value in parts.headers.get_all(name) {
                hasher.update(format!("{}:", value.len()).as_bytes());
                hasher.update(value.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }
}

impl KeyPolicy for HashedKeyPolicy {
    fn derive(&self, parts: &Parts) -> Option<CacheKey> {
        let token = idempotency_token(&parts.headers, &self.header)?;
        Some(CacheKey::new(token, self.digest(parts)))
    }
}
