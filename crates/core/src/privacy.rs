//! Privacy gate
//!
//! Opt-out is recorded per (app_uuid, anon_user_id) and is advisory only: it
//! bars admission and processing but never deletes previously stored rows.
//! Deletion is a separate, explicit operation.

use sqlx::{PgExecutor, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Whether the pair has opted out of analytics collection.
pub async fn is_opted_out<'e, E>(
    executor: E,
    app_uuid: Uuid,
    anon_user_id: &str,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'e>,
{
    let row: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT 1
        FROM opt_out
        WHERE app_uuid = $1
          AND anon_user_id = $2
        LIMIT 1
        "#,
    )
    .bind(app_uuid)
    .bind(anon_user_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}

/// Record an opt-out. Idempotent.
pub async fn record_opt_out<'e, E>(
    executor: E,
    app_uuid: Uuid,
    anon_user_id: &str,
) -> sqlx::Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO opt_out (app_uuid, anon_user_id)
        VALUES ($1, $2)
        ON CONFLICT (app_uuid, anon_user_id) DO NOTHING
        "#,
    )
    .bind(app_uuid)
    .bind(anon_user_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Tables cleared by [`delete_user_data`], in deletion order.
const DELETE_TABLES: [&str; 5] = [
    "customer_360",
    "license_state",
    "user_hourly_presence",
    "device_hourly_presence",
    "raw_events",
];

/// Delete all stored rows for a user within an app, returning per-table
/// delete counts. Broker messages already published are untouched. The
/// opt-out row itself is only removed when `delete_opt_out` is set.
pub async fn delete_user_data(
    pool: &PgPool,
    app_uuid: Uuid,
    anon_user_id: &str,
    delete_opt_out: bool,
) -> sqlx::Result<BTreeMap<&'static str, u64>> {
    let mut tx = pool.begin().await?;
    let mut deleted = BTreeMap::new();

    for table in DELETE_TABLES {
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE app_uuid = $1 AND anon_user_id = $2"
        ))
        .bind(app_uuid)
        .bind(anon_user_id)
        .execute(&mut *tx)
        .await?;
        deleted.insert(table, result.rows_affected());
    }

    if delete_opt_out {
        let result = sqlx::query("DELETE FROM opt_out WHERE app_uuid = $1 AND anon_user_id = $2")
            .bind(app_uuid)
            .bind(anon_user_id)
            .execute(&mut *tx)
            .await?;
        deleted.insert("opt_out", result.rows_affected());
    }

    tx.commit().await?;
    Ok(deleted)
}
