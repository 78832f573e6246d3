//! Configuration for worker process
//!
//! Loads configuration from environment variables

use anyhow::{Context, Result};
use smartbuket_core::CoreConfig;
use std::env;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared configuration (database, broker, topics, retry policy)
    pub core: CoreConfig,

    /// Outbox rows leased per publisher poll
    pub batch_size: i64,

    /// Publish attempts before an outbox row is marked failed
    pub max_retry_count: i32,

    /// Broker prefetch limit per consumer channel
    pub prefetch_count: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            core: CoreConfig::from_env()?,

            batch_size: env::var("WORKER_BATCH_SIZE")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("WORKER_BATCH_SIZE must be a valid integer")?,

            max_retry_count: env::var("WORKER_MAX_RETRY_COUNT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("WORKER_MAX_RETRY_COUNT must be a valid integer")?,

            prefetch_count: env::var("WORKER_PREFETCH_COUNT")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("WORKER_PREFETCH_COUNT must be a valid integer")?,
        })
    }
}

/// Fixed configuration for unit and database tests.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    use smartbuket_core::config::Topics;

    Config {
        core: CoreConfig {
            database_url: "postgres://localhost".to_string(),
            db_max_connections: 10,
            rabbitmq_url: "amqp://localhost".to_string(),
            rabbitmq_exchange: "sb.events".to_string(),
            topics: Topics::default(),
            strict_envelope: false,
            processor_group_id: "sb-processor".to_string(),
            processor_max_retries: 5,
            processor_retry_base_seconds: 0.5,
            processor_retry_max_seconds: 10.0,
            h3_resolutions: vec![7, 9, 11],
        },
        batch_size: 50,
        max_retry_count: 10,
        prefetch_count: 50,
    }
}
