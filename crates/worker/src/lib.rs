//! SmartBuket Worker
//!
//! Two long-lived loops: the outbox publisher drains staged broker messages
//! with exclusive leases, and the event processor consumes the geo/license
//! queues into the presence, license and Customer-360 projections.

pub mod broker;
mod config;
pub mod dlq;
pub mod error;
pub mod geo;
pub mod license;
pub mod presence;
pub mod processor;
pub mod publisher;

pub use config::Config;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the outbox publisher and the event processor until cancelled or one
/// of them fails.
///
/// # Arguments
/// * `pool` - Database connection pool
/// * `config` - Worker configuration
/// * `shutdown` - Optional cancellation token for graceful shutdown
pub async fn run_worker(
    pool: PgPool,
    config: Config,
    shutdown: Option<CancellationToken>,
) -> Result<()> {
    let shutdown = shutdown.unwrap_or_default();

    info!(
        "Starting worker: batch_size={}, prefetch={}, consumer={}",
        config.batch_size, config.prefetch_count, config.core.processor_group_id
    );

    let connection = broker::connect(&config.core.rabbitmq_url).await?;
    let channel = connection.create_channel().await?;
    broker::ensure_topology(&channel, &config.core.rabbitmq_exchange, &config.core.topics).await?;
    broker::enable_confirms(&channel).await?;

    let publisher = tokio::spawn(publisher::run_publisher(
        pool.clone(),
        channel,
        config.clone(),
        shutdown.clone(),
    ));
    let processor = tokio::spawn(processor::run_processor(pool, config, shutdown.clone()));

    let (publisher_result, processor_result) = tokio::join!(publisher, processor);
    publisher_result??;
    processor_result??;

    info!("Worker shutdown complete");
    Ok(())
}
