use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub idempotency: IdempotencySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// An empty `url` selects the in-memory user store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: 5,
        }
    }
}

/// An empty `url` selects the in-process cache provider.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

/// What the coordinator does when the cache cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LookupFailureMode {
    /// Treat the failure as a miss and execute the request.
    #[default]
    Open,
    /// Reject the request with 503.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicyKind {
    #[default]
    Uri,
    Hashed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub header_name: String,
    pub ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub key_prefix: String,
    pub protected_methods: Vec<String>,
    pub lookup_failure: LookupFailureMode,
    pub key_policy: KeyPolicyKind,
    pub scope_headers: Vec<String>,
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Id".to_string(),
            ttl_secs: 600,
            lock_ttl_secs: 30,
            key_prefix: "idem".to_string(),
            protected_methods: vec!["POST".to_string()],
            lookup_failure: LookupFailureMode::Open,
            key_policy: KeyPolicyKind::Uri,
            scope_headers: Vec::new(),
            sweep_interval_secs: 60,
        }
    }
}

impl IdempotencySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("idempotency.protected_methods")
                    .with_list_parse_key("idempotency.scope_headers")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
