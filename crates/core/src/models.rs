//! Core domain models
//!
//! These models represent the write-path entities and map to database tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbox row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

/// A staged broker message awaiting publish.
///
/// `sent` and `failed` are terminal; a row is leasable iff it is pending,
/// due, and not currently locked (or its lock has expired).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub app_uuid: Uuid,
    pub event_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retries: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Dedupe ledger entry; the insert itself is the fence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct ProcessedEvent {
    pub consumer: String,
    pub app_uuid: Uuid,
    pub event_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

/// Per-user license projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct LicenseState {
    pub app_uuid: Uuid,
    pub anon_user_id: String,
    pub device_id_hash: Option<String>,
    pub plan_type: String,
    pub license_status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Customer-360 projection row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct Customer360 {
    pub app_uuid: Uuid,
    pub anon_user_id: String,
    pub device_id_hash: Option<String>,

    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_event_type: Option<String>,
    pub last_session_id: Option<String>,
    pub last_sdk_version: Option<String>,
    pub last_event_version: Option<String>,

    pub last_h3_r9: Option<String>,
    pub last_place_id: Option<String>,
    pub last_admin_country_code: Option<String>,
    pub last_admin_province_code: Option<String>,
    pub last_admin_municipality_code: Option<String>,
    pub last_admin_sector_code: Option<String>,

    pub geo_events_count: i64,
    pub license_events_count: i64,
    pub active_user_hours_count: i64,
    pub active_device_hours_count: i64,

    pub last_plan_type: Option<String>,
    pub last_license_status: Option<String>,
    pub license_started_at: Option<DateTime<Utc>>,
    pub license_renewed_at: Option<DateTime<Utc>>,
    pub license_expires_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}
