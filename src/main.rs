use idempotent_gateway::api::{create_router, AppState};
use idempotent_gateway::cache::{CacheProvider, InMemoryProvider, ProviderSweeper, RedisProvider};
use idempotent_gateway::config::Settings;
use idempotent_gateway::idempotency::{IdempotencyCache, IdempotencyCoordinator};
use idempotent_gateway::observability::{init_logging, init_metrics, LogConfig};
use idempotent_gateway::repositories::{InMemoryUserRepository, PostgresUserRepository, UserRepository};
use idempotent_gateway::services::UserService;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.logging));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Cache provider
    let provider: Arc<dyn CacheProvider> = if settings.redis.url.is_empty() {
        info!("Using in-process idempotency cache");
        let provider = Arc::new(InMemoryProvider::new());
        let interval = Duration::from_secs(settings.idempotency.sweep_interval_secs.max(1));
        ProviderSweeper::new(Arc::clone(&provider), interval).start();
        provider
    } else {
        info!("Connecting to Redis...");
        let client = redis::Client::open(settings.redis.url.as_str())?;
        let provider = RedisProvider::connect(client).await?;
        info!("Redis connection established");
        Arc::new(provider)
    };

    let cache = IdempotencyCache::new(
        provider,
        settings.idempotency.key_prefix.clone(),
        settings.idempotency.ttl(),
    )
    .with_lock_ttl(settings.idempotency.lock_ttl());
    let coordinator = IdempotencyCoordinator::from_settings(Arc::new(cache), &settings.idempotency)?;

    // User store
    let repository: Arc<dyn UserRepository> = if settings.database.url.is_empty() {
        info!("Using in-memory user store");
        Arc::new(InMemoryUserRepository::new())
    } else {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(settings.database.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&settings.database.url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database connection established and migrations applied");
        Arc::new(PostgresUserRepository::new(pool))
    };

    let state = AppState::new(UserService::new(repository), Arc::new(coordinator))
        .with_metrics(metrics_handle);
    let app = create_router(state);

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
