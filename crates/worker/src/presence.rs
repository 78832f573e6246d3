//! Presence materialization
//!
//! Turns a geo ping into hourly device/user presence, H3/place/admin hourly
//! aggregates and the Customer-360 projection. Every write is an
//! `INSERT .. ON CONFLICT` upsert; aggregate increments are derived from the
//! rowcount of the presence insert so a redelivered event can never
//! double-count.

use crate::error::ProcessError;
use crate::geo::{
    self, H3CellCache, ensure_h3_cell, floor_to_hour, lookup_admin_codes, lookup_place_id,
};
use serde_json::Value;
use smartbuket_core::{CanonicalEvent, CoreConfig, parse_event};
use sqlx::{Postgres, Transaction};

const INSERT_DEVICE_PRESENCE_SQL: &str = r#"
INSERT INTO device_hourly_presence (
    app_uuid, hour_bucket, device_id_hash, anon_user_id,
    h3_r7, h3_r9, h3_r11, place_id,
    admin_country_code, admin_province_code, admin_municipality_code, admin_sector_code,
    geo_accuracy_m, geo_precision_class, first_event_ts
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (app_uuid, hour_bucket, device_id_hash) DO NOTHING
RETURNING 1
"#;

const INSERT_USER_PRESENCE_SQL: &str = r#"
INSERT INTO user_hourly_presence (
    app_uuid, hour_bucket, anon_user_id,
    h3_r7, h3_r9, h3_r11, place_id,
    admin_country_code, admin_province_code, admin_municipality_code, admin_sector_code,
    geo_accuracy_m, geo_precision_class, first_event_ts
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT (app_uuid, hour_bucket, anon_user_id) DO NOTHING
RETURNING 1
"#;

const UPSERT_AGG_H3_SQL: &str = r#"
INSERT INTO agg_h3_r9_hourly (app_uuid, hour_bucket, h3_r9, devices_count, users_count, updated_at)
VALUES ($1, $2, $3, $4, $5, now())
ON CONFLICT (app_uuid, hour_bucket, h3_r9)
DO UPDATE SET
    devices_count = agg_h3_r9_hourly.devices_count + EXCLUDED.devices_count,
    users_count = agg_h3_r9_hourly.users_count + EXCLUDED.users_count,
    updated_at = now()
"#;

const UPSERT_AGG_PLACE_SQL: &str = r#"
INSERT INTO agg_place_hourly (app_uuid, hour_bucket, place_id, devices_count, users_count, updated_at)
VALUES ($1, $2, $3, $4, $5, now())
ON CONFLICT (app_uuid, hour_bucket, place_id)
DO UPDATE SET
    devices_count = agg_place_hourly.devices_count + EXCLUDED.devices_count,
    users_count = agg_place_hourly.users_count + EXCLUDED.users_count,
    updated_at = now()
"#;

const UPSERT_AGG_ADMIN_SQL: &str = r#"
INSERT INTO agg_admin_hourly (app_uuid, hour_bucket, level, code, devices_count, users_count, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, now())
ON CONFLICT (app_uuid, hour_bucket, level, code)
DO UPDATE SET
    devices_count = agg_admin_hourly.devices_count + EXCLUDED.devices_count,
    users_count = agg_admin_hourly.users_count + EXCLUDED.users_count,
    updated_at = now()
"#;

const UPSERT_CUSTOMER_360_GEO_SQL: &str = r#"
INSERT INTO customer_360 (
    app_uuid, anon_user_id, device_id_hash,
    first_seen_at, last_seen_at,
    last_event_type, last_session_id, last_sdk_version, last_event_version,
    last_h3_r9, last_place_id,
    last_admin_country_code, last_admin_province_code, last_admin_municipality_code, last_admin_sector_code,
    geo_events_count, active_user_hours_count, active_device_hours_count,
    updated_at
)
VALUES (
    $1, $2, $3,
    $4, $4,
    $5, $6, $7, $8,
    $9, $10,
    $11, $12, $13, $14,
    1,
    (
        SELECT COUNT(*)
        FROM user_hourly_presence
        WHERE app_uuid = $1
          AND anon_user_id = $2
    ),
    (
        SELECT COUNT(*)
        FROM device_hourly_presence
        WHERE app_uuid = $1
          AND device_id_hash = $3
    ),
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
    last_h3_r9 = EXCLUDED.last_h3_r9,
    last_place_id = EXCLUDED.last_place_id,
    last_admin_country_code = EXCLUDED.last_admin_country_code,
    last_admin_province_code = EXCLUDED.last_admin_province_code,
    last_admin_municipality_code = EXCLUDED.last_admin_municipality_code,
    last_admin_sector_code = EXCLUDED.last_admin_sector_code,
    geo_events_count = customer_360.geo_events_count + 1,
    active_user_hours_count = (
        SELECT COUNT(*)
        FROM user_hourly_presence
        WHERE app_uuid = customer_360.app_uuid
          AND anon_user_id = customer_360.anon_user_id
    ),
    active_device_hours_count = (
        SELECT COUNT(*)
        FROM device_hourly_presence
        WHERE app_uuid = customer_360.app_uuid
          AND device_id_hash = EXCLUDED.device_id_hash
    ),
    updated_at = now()
"#;

/// Materialize presence for one geo event inside the caller's transaction.
///
/// Exits silently when the document carries no usable coordinates: not every
/// event on the geo queue has a geo context, and that is not an error.
pub async fn upsert_presence(
    tx: &mut Transaction<'_, Postgres>,
    config: &CoreConfig,
    h3_cache: &H3CellCache,
    doc: &Value,
) -> Result<(), ProcessError> {
    let event = parse_event(doc, config.parse_mode())?;

    let Some(sample) = event.geo() else {
        return Ok(());
    };
    let Some(dims) = geo::compute_geo_dims(&sample, &config.h3_resolutions) else {
        return Ok(());
    };

    for cell in dims.cells() {
        ensure_h3_cell(&mut **tx, h3_cache, cell).await?;
    }

    let place_id = lookup_place_id(&mut **tx, dims.lat, dims.lon, event.timestamp).await?;
    let admin = lookup_admin_codes(&mut **tx, dims.lat, dims.lon, event.timestamp)
        .await?
        .degraded(dims.precision_class);

    let hour_bucket = floor_to_hour(event.timestamp);
    let h3_r7 = dims.h3_r7.map(|c| c.to_string());
    let h3_r9 = dims.h3_r9.map(|c| c.to_string());
    let h3_r11 = dims.h3_r11.map(|c| c.to_string());

    let device_inserted: bool = sqlx::query_scalar::<_, i32>(INSERT_DEVICE_PRESENCE_SQL)
        .bind(event.app_uuid)
        .bind(hour_bucket)
        .bind(&event.device_id_hash)
        .bind(&event.anon_user_id)
        .bind(&h3_r7)
        .bind(&h3_r9)
        .bind(&h3_r11)
        .bind(&place_id)
        .bind(&admin.country)
        .bind(&admin.province)
        .bind(&admin.municipality)
        .bind(&admin.sector)
        .bind(dims.accuracy_m)
        .bind(dims.precision_class.as_str())
        .bind(event.timestamp)
        .fetch_optional(&mut **tx)
        .await?
        .is_some();

    let user_inserted: bool = sqlx::query_scalar::<_, i32>(INSERT_USER_PRESENCE_SQL)
        .bind(event.app_uuid)
        .bind(hour_bucket)
        .bind(&event.anon_user_id)
        .bind(&h3_r7)
        .bind(&h3_r9)
        .bind(&h3_r11)
        .bind(&place_id)
        .bind(&admin.country)
        .bind(&admin.province)
        .bind(&admin.municipality)
        .bind(&admin.sector)
        .bind(dims.accuracy_m)
        .bind(dims.precision_class.as_str())
        .bind(event.timestamp)
        .fetch_optional(&mut **tx)
        .await?
        .is_some();

    let devices_inc = i64::from(device_inserted);
    let users_inc = i64::from(user_inserted);

    if devices_inc > 0 || users_inc > 0 {
        if let Some(h3_r9) = &h3_r9 {
            sqlx::query(UPSERT_AGG_H3_SQL)
                .bind(event.app_uuid)
                .bind(hour_bucket)
                .bind(h3_r9)
                .bind(devices_inc)
                .bind(users_inc)
                .execute(&mut **tx)
                .await?;
        }

        if let Some(place_id) = &place_id {
            sqlx::query(UPSERT_AGG_PLACE_SQL)
                .bind(event.app_uuid)
                .bind(hour_bucket)
                .bind(place_id)
                .bind(devices_inc)
                .bind(users_inc)
                .execute(&mut **tx)
                .await?;
        }

        for (level, code) in admin.levels() {
            sqlx::query(UPSERT_AGG_ADMIN_SQL)
                .bind(event.app_uuid)
                .bind(hour_bucket)
                .bind(level)
                .bind(code)
                .bind(devices_inc)
                .bind(users_inc)
                .execute(&mut **tx)
                .await?;
        }
    }

    upsert_customer_360_from_geo(tx, &event, &h3_r9, &place_id, &admin).await?;

    Ok(())
}

async fn upsert_customer_360_from_geo(
    tx: &mut Transaction<'_, Postgres>,
    event: &CanonicalEvent,
    h3_r9: &Option<String>,
    place_id: &Option<String>,
    admin: &geo::AdminCodes,
) -> Result<(), ProcessError> {
    sqlx::query(UPSERT_CUSTOMER_360_GEO_SQL)
        .bind(event.app_uuid)
        .bind(&event.anon_user_id)
        .bind(&event.device_id_hash)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(&event.session_id)
        .bind(&event.sdk_version)
        .bind(&event.event_version)
        .bind(h3_r9)
        .bind(place_id)
        .bind(&admin.country)
        .bind(&admin.province)
        .bind(&admin.municipality)
        .bind(&admin.sector)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
