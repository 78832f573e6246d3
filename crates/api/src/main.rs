//! SmartBuket Ingest API Server
//!
//! Axum-based ingest service: admits event batches into the raw store and
//! stages broker fan-out through the transactional outbox.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    smartbuket_shared::bootstrap::init_env();
    let _guard = smartbuket_shared::bootstrap::init_tracing("api");

    tracing::info!("Starting SmartBuket ingest API");

    let config = api::config::Config::from_env()?;
    let pool = smartbuket_shared::bootstrap::init_db(&config.core).await?;

    let state = api::AppState {
        pool,
        config: config.core.clone(),
    };

    api::run_api(state, &config).await?;

    Ok(())
}
