//! Error types for envelope validation

use thiserror::Error;

/// Envelope parsing/shape failures.
///
/// Every variant names the offending field so ingest can report a
/// per-document rejection reason.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("missing required envelope fields: {0:?}")]
    MissingEnvelopeFields(Vec<&'static str>),

    #[error("missing required fields: {0:?}")]
    MissingFields(Vec<&'static str>),

    #[error("{0} must be ISO-8601 string")]
    TimestampNotString(&'static str),

    #[error("invalid {0}")]
    InvalidTimestamp(&'static str),

    #[error("invalid {0}")]
    InvalidUuid(&'static str),

    #[error("{0} must be object")]
    FieldNotObject(&'static str),

    #[error("missing {0}")]
    MissingValue(&'static str),
}
