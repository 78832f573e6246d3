//! SmartBuket unified server
//!
//! Runs the ingest API and the worker (outbox publisher + event processor)
//! in one process with a shared pool and coordinated shutdown.

use anyhow::Result;
use sqlx::PgPool;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    smartbuket_shared::bootstrap::init_env();

    // The guard must be kept alive for the duration of the program to ensure
    // logs are flushed
    let _guard = smartbuket_shared::bootstrap::init_tracing("smartbuket");

    tracing::info!("Starting SmartBuket unified server");

    let api_config = api::config::Config::from_env()?;
    let worker_config = worker::Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = smartbuket_shared::bootstrap::init_db(&api_config.core).await?;

    let shutdown = CancellationToken::new();

    let api_handle = spawn_api(pool.clone(), api_config, shutdown.clone());
    let worker_handle = spawn_worker(pool, worker_config, shutdown.clone());

    tracing::info!("All services started");

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();

    let _ = tokio::join!(api_handle, worker_handle);

    tracing::info!("All services stopped gracefully");
    Ok(())
}

fn spawn_api(
    pool: PgPool,
    config: api::config::Config,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let state = api::AppState {
            pool,
            config: config.core.clone(),
        };

        tokio::select! {
            result = api::run_api(state, &config) => {
                tracing::error!("API service exited: {:?}", result);
                result.map_err(|e| anyhow::anyhow!(e))
            }
            _ = shutdown.cancelled() => {
                tracing::info!("API service shutting down");
                Ok(())
            }
        }
    })
}

fn spawn_worker(
    pool: PgPool,
    config: worker::Config,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move { worker::run_worker(pool, config, Some(shutdown)).await })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
