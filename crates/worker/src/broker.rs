//! RabbitMQ plumbing
//!
//! Connection setup, topology declaration and the publish helper shared by
//! the outbox publisher, the processor republish path and the DLQ.

use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use smartbuket_core::config::Topics;

/// Durable queue bound to a routing key.
pub fn queue_name(routing_key: &str) -> String {
    format!("{routing_key}.q")
}

/// Open a broker connection.
pub async fn connect(url: &str) -> Result<Connection, lapin::Error> {
    Connection::connect(url, ConnectionProperties::default()).await
}

/// Declare the durable topic exchange and one durable queue per routing key.
/// Safe to call repeatedly; declarations are idempotent.
pub async fn ensure_topology(
    channel: &Channel,
    exchange: &str,
    topics: &Topics,
) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    for routing_key in topics.all() {
        let queue = queue_name(routing_key);
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(())
}

/// Enable publisher confirms so a successful publish means the broker took
/// the message.
pub async fn enable_confirms(channel: &Channel) -> Result<(), lapin::Error> {
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
}

/// Publish a persistent JSON message, waiting for the broker confirm.
pub async fn publish_json(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    headers: Option<FieldTable>,
) -> Result<(), lapin::Error> {
    let mut properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2);
    if let Some(headers) = headers {
        properties = properties.with_headers(headers);
    }

    channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await?
        .await?;

    Ok(())
}
