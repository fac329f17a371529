pub mod cache;
pub mod capture;
pub mod key;
pub mod middleware;
pub mod policy;

pub use cache::{CachedResponse, IdempotencyCache};
pub use capture::ResponseCapture;
pub use key::{idempotency_token, CacheKey, HashedKeyPolicy, KeyPolicy, LockKey, UriKeyPolicy};
pub use middleware::{idempotency_middleware, IdempotencyCoordinator, IdempotencyMetrics, MetricsSnapshot};
pub use policy::{CacheabilityPolicy, SuccessRange};
