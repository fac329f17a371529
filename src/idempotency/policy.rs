use http::StatusCode;

/// Decides whether a finished response may be stored for replay.
pub trait CacheabilityPolicy: Send + Sync {
    fn is_cacheable(&self, status: StatusCode) -> bool;
}

/// Caches 2xx and 3xx responses. Errors are never frozen into replays, so
/// a retry after a failure runs the handler again.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessRange;

impl CacheabilityPolicy for SuccessRange {
    fn is_cacheable(&self, status: StatusCode) -> bool {
        (200..400).contains(&status.as_u16())
    }
}

impl<F> CacheabilityPolicy for F
where
    F: Fn(StatusCode) -> bool + Send + Sync,
{
    fn is_cacheable(&self, status: StatusCode) -> bool {
        self(status)
    }
}
