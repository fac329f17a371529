pub mod provider;
pub mod redis_provider;

pub use provider::{CacheProvider, InMemoryProvider, ProviderSweeper};
pub use redis_provider::RedisProvider;
