//! Ingest API configuration from environment variables

use anyhow::{Context, Result};
use smartbuket_core::CoreConfig;
use std::env;

/// Ingest API configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared configuration (database, broker, topics, envelope mode)
    pub core: CoreConfig,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            core: CoreConfig::from_env()?,
            host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("API_PORT must be a valid port number")?,
        })
    }
}
