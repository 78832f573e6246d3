//! Process bootstrap shared by the SmartBuket binaries: dotenv, tracing and
//! the database pool with schema migrations applied.

use anyhow::Result;
use smartbuket_core::CoreConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize dotenvy
pub fn init_env() {
    dotenvy::dotenv().ok();
}

/// Initialize tracing: pretty stdout plus, unless `ENABLE_FILE_LOGGING` is
/// off, a daily-rolling JSON file under `LOG_DIR`.
///
/// The returned guard must be kept alive for the lifetime of the process so
/// buffered log lines are flushed on exit.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("info,{service_name}=debug,sqlx=warn").into());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    let file_logging = std::env::var("ENABLE_FILE_LOGGING")
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(true);
    if !file_logging {
        registry.init();
        return None;
    }

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let file_appender =
        tracing_appender::rolling::daily(log_dir, format!("smartbuket-{service_name}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .json(),
        )
        .init();

    Some(guard)
}

/// Connect the shared pool and apply pending migrations.
pub async fn init_db(config: &CoreConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .idle_timeout(std::time::Duration::from_secs(300))
        .max_lifetime(std::time::Duration::from_secs(1800)) // 30 minutes
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        "Database pool established (max_connections: {})",
        config.db_max_connections
    );

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}
