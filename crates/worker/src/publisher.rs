//! Outbox publisher
//!
//! Polls the outbox for due rows, leases a batch atomically and publishes
//! each message to the topic exchange. The lease statement updates
//! `locked_at` in the same SQL round trip that selects the IDs; that single
//! compound statement is what keeps concurrent publishers from ever holding
//! the same row within a lease.

use crate::broker;
use crate::config::Config;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lapin::Channel;
use sqlx::{FromRow, PgPool};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A leased outbox row ready to publish.
#[derive(Debug, Clone, FromRow)]
pub struct LeasedMessage {
    pub id: i64,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub retries: i32,
}

// Rows locked longer than the 5-minute lease TTL count as abandoned and
// become re-leasable.
const LEASE_SQL: &str = r#"
WITH due AS (
    SELECT id
    FROM outbox_events
    WHERE status = 'pending'
      AND next_attempt_at <= now()
      AND (
        locked_at IS NULL
        OR locked_at < (now() - interval '5 minutes')
      )
    ORDER BY id
    FOR UPDATE SKIP LOCKED
    LIMIT $1
), leased AS (
    UPDATE outbox_events o
    SET locked_at = now()
    FROM due
    WHERE o.id = due.id
    RETURNING o.id, o.routing_key, o.payload, o.retries
)
SELECT id, routing_key, payload, retries FROM leased
"#;

const MARK_SENT_SQL: &str = r#"
UPDATE outbox_events
SET status = 'sent', locked_at = NULL
WHERE id = $1
"#;

const MARK_FAILED_SQL: &str = r#"
UPDATE outbox_events
SET retries = retries + 1,
    last_error = $2,
    next_attempt_at = $3,
    locked_at = NULL,
    status = CASE WHEN retries + 1 >= $4 THEN 'failed'::outbox_status ELSE 'pending'::outbox_status END
WHERE id = $1
"#;

/// Exponential publish backoff with a 5-minute cap.
pub fn backoff_seconds(retries: i32) -> i64 {
    let exponent = (retries + 1).clamp(1, 9) as u32;
    (1_i64 << exponent).min(300)
}

/// Atomically lease up to `limit` due rows, stamping `locked_at`.
pub async fn lease_batch(pool: &PgPool, limit: i64) -> sqlx::Result<Vec<LeasedMessage>> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query_as::<_, LeasedMessage>(LEASE_SQL)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Terminal success: the broker confirmed the publish.
pub async fn mark_sent(pool: &PgPool, id: i64) -> sqlx::Result<()> {
    sqlx::query(MARK_SENT_SQL).bind(id).execute(pool).await?;
    Ok(())
}

/// Publish failure: release the lock, schedule the retry, flip to failed
/// once the cap is reached.
pub async fn mark_failed(
    pool: &PgPool,
    id: i64,
    retries: i32,
    max_retries: i32,
    error: &str,
) -> sqlx::Result<()> {
    let next_attempt_at: DateTime<Utc> =
        Utc::now() + ChronoDuration::seconds(backoff_seconds(retries));

    sqlx::query(MARK_FAILED_SQL)
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .bind(max_retries)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run the publisher loop until cancelled.
///
/// A leased batch is always drained, even when shutdown fires mid-batch, so
/// no row stays locked longer than one publish round.
pub async fn run_publisher(
    pool: PgPool,
    channel: Channel,
    config: Config,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Starting outbox publisher: batch_size={}, max_retries={}",
        config.batch_size, config.max_retry_count
    );

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let batch = match lease_batch(&pool, config.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                error!("Failed to lease outbox batch: {}", err);
                if idle_or_shutdown(&shutdown).await {
                    break;
                }
                continue;
            }
        };

        if batch.is_empty() {
            if idle_or_shutdown(&shutdown).await {
                break;
            }
            continue;
        }

        for message in batch {
            match publish_message(&channel, &config, &message).await {
                Ok(()) => {
                    if let Err(err) = mark_sent(&pool, message.id).await {
                        error!("Failed to mark outbox row {} sent: {}", message.id, err);
                    }
                }
                Err(err) => {
                    warn!(
                        "Publish failed for outbox row {} (retry {}): {}",
                        message.id, message.retries, err
                    );
                    if let Err(db_err) = mark_failed(
                        &pool,
                        message.id,
                        message.retries,
                        config.max_retry_count,
                        &err.to_string(),
                    )
                    .await
                    {
                        error!(
                            "Failed to record publish failure for outbox row {}: {}",
                            message.id, db_err
                        );
                    }
                }
            }
        }
    }

    info!("Outbox publisher stopped");
    Ok(())
}

async fn publish_message(
    channel: &Channel,
    config: &Config,
    message: &LeasedMessage,
) -> Result<()> {
    let body = serde_json::to_vec(&message.payload)?;
    broker::publish_json(
        channel,
        &config.core.rabbitmq_exchange,
        &message.routing_key,
        &body,
        None,
    )
    .await?;
    Ok(())
}

/// Idle sleep between empty polls; returns true when shutdown fired.
async fn idle_or_shutdown(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(Duration::from_secs(1)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smartbuket_core::models::OutboxStatus;
    use uuid::Uuid;

    #[test]
    fn test_exponential_backoff_with_cap() {
        let retry_counts = [0, 1, 2, 3, 7];
        let expected_seconds = [2, 4, 8, 16, 256];

        for (retry, expected) in retry_counts.iter().zip(expected_seconds.iter()) {
            assert_eq!(backoff_seconds(*retry), *expected);
        }

        // 2^9 = 512 caps to 300
        assert_eq!(backoff_seconds(8), 300);
        assert_eq!(backoff_seconds(100), 300);
    }

    async fn stage_row(pool: &PgPool, routing_key: &str) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO outbox_events (app_uuid, event_id, trace_id, occurred_at, routing_key, payload)
            VALUES ($1, $2, $3, now(), $4, $5)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(Uuid::new_v4())
        .bind(Uuid::new_v4())
        .bind(routing_key)
        .bind(json!({"hello": "world"}))
        .fetch_one(pool)
        .await
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_lease_locks_rows_in_one_statement(pool: PgPool) -> sqlx::Result<()> {
        let id = stage_row(&pool, "sb.events.geo").await?;

        let batch = lease_batch(&pool, 10).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].routing_key, "sb.events.geo");
        assert_eq!(batch[0].retries, 0);

        let locked_at: Option<chrono::DateTime<Utc>> =
            sqlx::query_scalar("SELECT locked_at FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await?;
        assert!(locked_at.is_some());

        // The same row is not leasable again while the lease holds.
        let second = lease_batch(&pool, 10).await?;
        assert!(second.is_empty());

        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_lease_skips_future_and_terminal_rows(pool: PgPool) -> sqlx::Result<()> {
        let due = stage_row(&pool, "sb.events.raw").await?;
        let future = stage_row(&pool, "sb.events.raw").await?;
        let sent = stage_row(&pool, "sb.events.raw").await?;
        let failed = stage_row(&pool, "sb.events.raw").await?;

        sqlx::query("UPDATE outbox_events SET next_attempt_at = now() + interval '1 hour' WHERE id = $1")
            .bind(future)
            .execute(&pool)
            .await?;
        sqlx::query("UPDATE outbox_events SET status = 'sent' WHERE id = $1")
            .bind(sent)
            .execute(&pool)
            .await?;
        sqlx::query("UPDATE outbox_events SET status = 'failed' WHERE id = $1")
            .bind(failed)
            .execute(&pool)
            .await?;

        let batch = lease_batch(&pool, 10).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, due);

        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_expired_lease_is_reclaimed(pool: PgPool) -> sqlx::Result<()> {
        let id = stage_row(&pool, "sb.events.geo").await?;

        // A publisher crashed mid-publish six minutes ago.
        sqlx::query("UPDATE outbox_events SET locked_at = now() - interval '6 minutes' WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await?;

        let batch = lease_batch(&pool, 10).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);

        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_mark_sent_is_terminal(pool: PgPool) -> sqlx::Result<()> {
        let id = stage_row(&pool, "sb.events.geo").await?;
        lease_batch(&pool, 10).await?;
        mark_sent(&pool, id).await?;

        let (status, locked_at): (OutboxStatus, Option<chrono::DateTime<Utc>>) =
            sqlx::query_as("SELECT status, locked_at FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await?;
        assert_eq!(status, OutboxStatus::Sent);
        assert!(locked_at.is_none());

        assert!(lease_batch(&pool, 10).await?.is_empty());

        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_mark_failed_schedules_retry_then_exhausts(pool: PgPool) -> sqlx::Result<()> {
        let id = stage_row(&pool, "sb.events.geo").await?;

        mark_failed(&pool, id, 0, 2, "connection refused").await?;

        let (status, retries, last_error): (OutboxStatus, i32, Option<String>) = sqlx::query_as(
            "SELECT status, retries, last_error FROM outbox_events WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&pool)
        .await?;
        assert_eq!(status, OutboxStatus::Pending);
        assert_eq!(retries, 1);
        assert_eq!(last_error.as_deref(), Some("connection refused"));

        // Backoff pushed next_attempt_at into the future.
        assert!(lease_batch(&pool, 10).await?.is_empty());

        mark_failed(&pool, id, 1, 2, "connection refused").await?;

        let status: OutboxStatus =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await?;
        assert_eq!(status, OutboxStatus::Failed);

        Ok(())
    }
}
