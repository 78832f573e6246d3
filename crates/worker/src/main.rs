//! SmartBuket Worker - outbox publisher + event processor

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    smartbuket_shared::bootstrap::init_env();
    let _guard = smartbuket_shared::bootstrap::init_tracing("worker");

    tracing::info!("Starting SmartBuket worker");

    let config = worker::Config::from_env()?;
    let pool = smartbuket_shared::bootstrap::init_db(&config.core).await?;

    let shutdown = CancellationToken::new();
    let worker_handle = tokio::spawn(worker::run_worker(
        pool,
        config,
        Some(shutdown.clone()),
    ));

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received, draining in-flight work");
    shutdown.cancel();

    worker_handle.await??;
    Ok(())
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
