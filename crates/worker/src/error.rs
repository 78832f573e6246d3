//! Processor error taxonomy
//!
//! Classifies failures during message handling: envelope errors go to the
//! DLQ, connectivity-shaped errors get an in-band retry, everything else is
//! terminal for the delivery.

use smartbuket_core::EnvelopeError;
use thiserror::Error;

/// Failure while handling one delivery.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
}

impl ProcessError {
    /// Connectivity and timeout failures are worth an in-band retry; domain
    /// and constraint failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Envelope(_) => false,
            Self::Db(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Broker(_) => true,
        }
    }

    /// Error class name carried in DLQ records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "EnvelopeError",
            Self::Db(_) => "DatabaseError",
            Self::Broker(_) => "BrokerError",
        }
    }
}
