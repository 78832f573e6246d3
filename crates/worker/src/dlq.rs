//! Dead-letter publishing
//!
//! Structured failure records for deliveries the processor cannot handle.
//! A DLQ publish failure is logged and swallowed: the original delivery
//! still has to be acked.

use crate::broker;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use lapin::Channel;
use serde_json::{Value, json};
use tracing::warn;

/// Error details attached to a DLQ record.
#[derive(Debug, Clone)]
pub struct DlqError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&crate::error::ProcessError> for DlqError {
    fn from(err: &crate::error::ProcessError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// The failure record published to the dead-letter routing key.
pub fn build_dlq_document(
    raw_body: &[u8],
    reason: &str,
    error: Option<&DlqError>,
    decoded: Option<&Value>,
) -> Value {
    let mut doc = json!({
        "failed_at": Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
        "reason": reason,
        "source": {"broker": "rabbitmq"},
        "payload": {
            "raw_value_b64": BASE64.encode(raw_body),
            "decoded": decoded,
        },
    });

    if let Some(error) = error {
        doc["error"] = json!({
            "type": error.kind,
            "message": error.message,
        });
    }

    doc
}

/// Publish a failure record. Never propagates: losing a DLQ record is
/// preferable to wedging the consumer on an unackable delivery.
pub async fn publish_dlq(
    channel: &Channel,
    exchange: &str,
    dlq_routing_key: &str,
    raw_body: &[u8],
    reason: &str,
    error: Option<&DlqError>,
    decoded: Option<&Value>,
) {
    let doc = build_dlq_document(raw_body, reason, error, decoded);
    let body = match serde_json::to_vec(&doc) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to serialize DLQ record: {}", err);
            return;
        }
    };

    if let Err(err) = broker::publish_json(channel, exchange, dlq_routing_key, &body, None).await {
        warn!(reason, "failed to publish DLQ message: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_document_shape() {
        let doc = build_dlq_document(b"not-json", "json_decode", None, None);

        assert_eq!(doc["reason"], json!("json_decode"));
        assert_eq!(doc["source"]["broker"], json!("rabbitmq"));
        assert!(doc["failed_at"].as_str().expect("failed_at").ends_with('Z'));
        assert!(doc.get("error").is_none());

        let b64 = doc["payload"]["raw_value_b64"].as_str().expect("b64");
        assert_eq!(BASE64.decode(b64).expect("decode"), b"not-json");
        assert_eq!(doc["payload"]["decoded"], Value::Null);
    }

    #[test]
    fn test_dlq_document_carries_error_and_decoded_payload() {
        let decoded = json!({"event_id": "abc"});
        let error = DlqError {
            kind: "EnvelopeError",
            message: "missing required fields".to_string(),
        };

        let doc = build_dlq_document(b"{}", "minimal_event", Some(&error), Some(&decoded));

        assert_eq!(doc["error"]["type"], json!("EnvelopeError"));
        assert_eq!(doc["error"]["message"], json!("missing required fields"));
        assert_eq!(doc["payload"]["decoded"]["event_id"], json!("abc"));
    }
}
