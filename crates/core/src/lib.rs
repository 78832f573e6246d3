//! SmartBuket core domain library
//!
//! Canonical event envelope, routing-key derivation, privacy gate and the
//! row models shared by the ingest API and the worker.

pub mod config;
pub mod envelope;
pub mod error;
pub mod models;
pub mod privacy;
pub mod routing;

pub use config::CoreConfig;
pub use envelope::{CanonicalEvent, GeoSample, ParseMode, parse_event};
pub use error::EnvelopeError;
