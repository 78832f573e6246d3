//! License materialization
//!
//! Updates per-user license state and the Customer-360 license columns from
//! `license.*` events. Payload keys are advisory; unknown values fall back
//! to `"unknown"` and unparseable timestamps to NULL.

use crate::error::ProcessError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use smartbuket_core::{CoreConfig, parse_event};
use sqlx::{Postgres, Transaction};

const UPSERT_LICENSE_STATE_SQL: &str = r#"
INSERT INTO license_state (
    app_uuid, anon_user_id, device_id_hash,
    plan_type, license_status,
    started_at, renewed_at, expires_at,
    updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
ON CONFLICT (app_uuid, anon_user_id)
DO UPDATE SET
    device_id_hash = EXCLUDED.device_id_hash,
    plan_type = EXCLUDED.plan_type,
    license_status = EXCLUDED.license_status,
    started_at = EXCLUDED.started_at,
    renewed_at = EXCLUDED.renewed_at,
    expires_at = EXCLUDED.expires_at,
    updated_at = now()
"#;

const UPSERT_CUSTOMER_360_LICENSE_SQL: &str = r#"
INSERT INTO customer_360 (
    app_uuid, anon_user_id, device_id_hash,
    first_seen_at, last_seen_at,
    last_event_type, last_session_id, last_sdk_version, last_event_version,
    license_events_count,
    last_plan_type, last_license_status,
    license_started_at, license_renewed_at, license_expires_at,
    updated_at
)
VALUES (
    $1, $2, $3,
    $4, $4,
    $5, $6, $7, $8,
    1,
    $9, $10,
    $11, $12, $13,
    now()
)
ON CONFLICT (app_uuid, anon_user_id)
DO UPDATE SET
    device_id_hash = EXCLUDED.device_id_hash,
    first_seen_at = LEAST(customer_360.first_seen_at, EXCLUDED.first_seen_at),
    last_seen_at = GREATEST(customer_360.last_seen_at, EXCLUDED.last_seen_at),
    last_event_type = EXCLUDED.last_event_type,
    last_session_id = EXCLUDED.last_session_id,
    last_sdk_version = EXCLUDED.last_sdk_version,
    last_event_version = EXCLUDED.last_event_version,
    license_events_count = customer_360.license_events_count + 1,
    last_plan_type = EXCLUDED.last_plan_type,
    last_license_status = EXCLUDED.last_license_status,
    license_started_at = EXCLUDED.license_started_at,
    license_renewed_at = EXCLUDED.license_renewed_at,
    license_expires_at = EXCLUDED.license_expires_at,
    updated_at = now()
"#;

/// ISO-8601 string or nothing; anything else maps to NULL.
fn maybe_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

/// Materialize one license event inside the caller's transaction.
pub async fn upsert_license(
    tx: &mut Transaction<'_, Postgres>,
    config: &CoreConfig,
    doc: &Value,
) -> Result<(), ProcessError> {
    let event = parse_event(doc, config.parse_mode())?;

    let plan_type = event
        .payload
        .get("plan_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let license_status = event
        .payload
        .get("license_status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let started_at = maybe_timestamp(event.payload.get("started_at"));
    let renewed_at = maybe_timestamp(event.payload.get("renewed_at"));
    let expires_at = maybe_timestamp(event.payload.get("expires_at"));

    sqlx::query(UPSERT_LICENSE_STATE_SQL)
        .bind(event.app_uuid)
        .bind(&event.anon_user_id)
        .bind(&event.device_id_hash)
        .bind(&plan_type)
        .bind(&license_status)
        .bind(started_at)
        .bind(renewed_at)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?;

    sqlx::query(UPSERT_CUSTOMER_360_LICENSE_SQL)
        .bind(event.app_uuid)
        .bind(&event.anon_user_id)
        .bind(&event.device_id_hash)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(&event.session_id)
        .bind(&event.sdk_version)
        .bind(&event.event_version)
        .bind(&plan_type)
        .bind(&license_status)
        .bind(started_at)
        .bind(renewed_at)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
