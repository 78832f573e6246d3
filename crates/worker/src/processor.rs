//! Event processor
//!
//! Consumes the geo and license queues, one sequential worker per queue.
//! Every delivery passes the processed-events fence and the privacy gate
//! before dispatching to a materializer; transient failures get a bounded
//! in-band retry via republish, everything else lands in the DLQ. Ack and
//! nack are the only points that release a delivery.

use crate::broker;
use crate::config::Config;
use crate::dlq::{self, DlqError};
use crate::error::ProcessError;
use crate::geo::H3CellCache;
use crate::license;
use crate::presence;
use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use lapin::{
    Channel,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable},
};
use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const MARK_PROCESSED_SQL: &str = r#"
INSERT INTO processed_events (consumer, app_uuid, event_id)
VALUES ($1, $2, $3)
ON CONFLICT (consumer, app_uuid, event_id) DO NOTHING
RETURNING 1
"#;

/// Soft bound on the opted-out pairs remembered per process.
const OPT_OUT_CACHE_CAPACITY: u64 = 10_000;

/// What to do with the delivery after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Shared state for one consumer task.
#[derive(Clone)]
pub struct ProcessorContext {
    pub pool: PgPool,
    pub channel: Channel,
    pub config: Config,
    pub opt_out_cache: Cache<(Uuid, String), ()>,
    pub h3_cache: Arc<H3CellCache>,
}

/// Positive opt-out cache shared by the consumer tasks. Safe to lose;
/// clearing only costs extra existence queries.
pub fn new_opt_out_cache() -> Cache<(Uuid, String), ()> {
    Cache::builder().max_capacity(OPT_OUT_CACHE_CAPACITY).build()
}

/// `sb_retry` header value, defaulting to 0.
pub fn retry_count(headers: Option<&FieldTable>) -> u32 {
    headers
        .and_then(|table| {
            table
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "sb_retry")
        })
        .and_then(|(_, value)| header_as_u32(value))
        .unwrap_or(0)
}

fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    let raw = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => return None,
    };
    u32::try_from(raw).ok()
}

/// Backoff before a transient republish.
pub fn retry_delay(retry: u32, base_seconds: f64, max_seconds: f64) -> Duration {
    let seconds = (base_seconds * 2_f64.powi(retry as i32)).min(max_seconds);
    Duration::from_secs_f64(seconds.max(0.0))
}

/// Run the dedupe fence, privacy gate and dispatch for one decoded document
/// inside a single transaction.
pub async fn materialize(
    pool: &PgPool,
    config: &Config,
    opt_out_cache: &Cache<(Uuid, String), ()>,
    h3_cache: &H3CellCache,
    routing_key: &str,
    doc: &Value,
) -> Result<(), ProcessError> {
    let mut tx = pool.begin().await?;

    let app_uuid = doc
        .get("app_uuid")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok());
    let event_id = doc
        .get("event_id")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok());

    // Dedupe fence: the insert is the exclusivity primitive. A redelivered
    // message skips all side effects but is still acked by the caller.
    if let (Some(app_uuid), Some(event_id)) = (app_uuid, event_id) {
        let fresh: bool = sqlx::query_scalar::<_, i32>(MARK_PROCESSED_SQL)
            .bind(&config.core.processor_group_id)
            .bind(app_uuid)
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !fresh {
            tx.commit().await?;
            return Ok(());
        }
    }

    if let (Some(app_uuid), Some(anon_user_id)) =
        (app_uuid, doc.get("anon_user_id").and_then(Value::as_str))
    {
        let cache_key = (app_uuid, anon_user_id.to_string());
        let opted_out = if opt_out_cache.contains_key(&cache_key) {
            true
        } else if smartbuket_core::privacy::is_opted_out(&mut *tx, app_uuid, anon_user_id).await? {
            opt_out_cache.insert(cache_key, ()).await;
            true
        } else {
            false
        };
        if opted_out {
            tx.commit().await?;
            return Ok(());
        }
    }

    let event_type = doc
        .get("event_type")
        .or_else(|| doc.get("event_name"))
        .and_then(Value::as_str)
        .unwrap_or("");

    if routing_key == config.core.topics.license || event_type.starts_with("license.") {
        license::upsert_license(&mut tx, &config.core, doc).await?;
    } else if event_type == "geo.ping" {
        presence::upsert_presence(&mut tx, &config.core, h3_cache, doc).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Handle one delivery end to end, returning how to settle it.
pub async fn handle_message(
    ctx: &ProcessorContext,
    routing_key: &str,
    headers: Option<&FieldTable>,
    body: &[u8],
) -> Disposition {
    let exchange = &ctx.config.core.rabbitmq_exchange;
    let dlq_topic = &ctx.config.core.topics.dlq;

    let doc: Value = match serde_json::from_slice(body) {
        Ok(doc) => doc,
        Err(err) => {
            let error = DlqError {
                kind: "JsonError",
                message: err.to_string(),
            };
            dlq::publish_dlq(
                &ctx.channel,
                exchange,
                dlq_topic,
                body,
                "json_decode",
                Some(&error),
                None,
            )
            .await;
            return Disposition::Ack;
        }
    };

    if !doc.is_object() {
        let error = DlqError {
            kind: "TypeError",
            message: format!("expected object, got {}", json_type_name(&doc)),
        };
        dlq::publish_dlq(
            &ctx.channel,
            exchange,
            dlq_topic,
            body,
            "invalid_document_type",
            Some(&error),
            None,
        )
        .await;
        return Disposition::Ack;
    }

    match materialize(
        &ctx.pool,
        &ctx.config,
        &ctx.opt_out_cache,
        &ctx.h3_cache,
        routing_key,
        &doc,
    )
    .await
    {
        Ok(()) => Disposition::Ack,
        Err(err @ ProcessError::Envelope(_)) => {
            warn!("envelope rejected, sending to DLQ: {}", err);
            dlq::publish_dlq(
                &ctx.channel,
                exchange,
                dlq_topic,
                body,
                "minimal_event",
                Some(&DlqError::from(&err)),
                Some(&doc),
            )
            .await;
            Disposition::Ack
        }
        Err(err) => {
            let retry = retry_count(headers);
            let max_retries = ctx.config.core.processor_max_retries;

            if err.is_transient() && retry < max_retries {
                let delay = retry_delay(
                    retry,
                    ctx.config.core.processor_retry_base_seconds,
                    ctx.config.core.processor_retry_max_seconds,
                );
                warn!(
                    "transient error (retry {}/{}) after {:?}: {}",
                    retry + 1,
                    max_retries,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;

                match republish_with_retry(ctx, routing_key, headers, body, retry + 1).await {
                    Ok(()) => Disposition::Ack,
                    Err(publish_err) => {
                        error!("republish failed, requeueing delivery: {}", publish_err);
                        Disposition::Requeue
                    }
                }
            } else {
                error!("unhandled error, sending to DLQ: {}", err);
                dlq::publish_dlq(
                    &ctx.channel,
                    exchange,
                    dlq_topic,
                    body,
                    "unhandled",
                    Some(&DlqError::from(&err)),
                    Some(&doc),
                )
                .await;
                Disposition::Ack
            }
        }
    }
}

/// Republish the same body to the same routing key with the retry headers
/// bumped.
async fn republish_with_retry(
    ctx: &ProcessorContext,
    routing_key: &str,
    headers: Option<&FieldTable>,
    body: &[u8],
    retry: u32,
) -> Result<(), lapin::Error> {
    let mut table = headers.cloned().unwrap_or_default();
    table.insert("sb_retry".into(), AMQPValue::LongInt(retry as i32));
    table.insert(
        "sb_retry_at".into(),
        AMQPValue::LongString(
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::AutoSi, true)
                .into(),
        ),
    );

    broker::publish_json(
        &ctx.channel,
        &ctx.config.core.rabbitmq_exchange,
        routing_key,
        body,
        Some(table),
    )
    .await
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Run both consumers until cancelled.
pub async fn run_processor(
    pool: PgPool,
    config: Config,
    shutdown: CancellationToken,
) -> Result<()> {
    let connection = broker::connect(&config.core.rabbitmq_url).await?;
    let opt_out_cache = new_opt_out_cache();
    let h3_cache = Arc::new(H3CellCache::new());

    let queues = [
        config.core.topics.geo.clone(),
        config.core.topics.license.clone(),
    ];

    let mut handles = Vec::new();
    for topic in queues {
        let channel = connection.create_channel().await?;
        broker::ensure_topology(&channel, &config.core.rabbitmq_exchange, &config.core.topics)
            .await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        let ctx = ProcessorContext {
            pool: pool.clone(),
            channel,
            config: config.clone(),
            opt_out_cache: opt_out_cache.clone(),
            h3_cache: Arc::clone(&h3_cache),
        };
        handles.push(tokio::spawn(consume_queue(ctx, topic, shutdown.clone())));
    }

    for handle in handles {
        handle.await??;
    }

    info!("Event processor stopped");
    Ok(())
}

/// One sequential worker bound to one queue. The delivery is owned from
/// receive to settle; shutdown stops pulling new deliveries.
async fn consume_queue(
    ctx: ProcessorContext,
    topic: String,
    shutdown: CancellationToken,
) -> Result<()> {
    let queue = broker::queue_name(&topic);
    let consumer_tag = format!("{}-{}", ctx.config.core.processor_group_id, topic);

    let mut consumer = ctx
        .channel
        .basic_consume(
            &queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("Consuming from {}", queue);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Consumer for {} shutting down", queue);
                break;
            }
            maybe_delivery = consumer.next() => {
                let Some(delivery_result) = maybe_delivery else {
                    warn!("Consumer stream for {} ended", queue);
                    break;
                };

                match delivery_result {
                    Ok(delivery) => {
                        let disposition = handle_message(
                            &ctx,
                            delivery.routing_key.as_str(),
                            delivery.properties.headers().as_ref(),
                            &delivery.data,
                        )
                        .await;

                        let settle = match disposition {
                            Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                            Disposition::Requeue => {
                                delivery
                                    .nack(BasicNackOptions {
                                        requeue: true,
                                        ..Default::default()
                                    })
                                    .await
                            }
                        };
                        if let Err(err) = settle {
                            error!("Failed to settle delivery on {}: {}", queue, err);
                        }
                    }
                    Err(err) => {
                        error!("Error receiving delivery on {}: {}", queue, err);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    Ok(())
}
