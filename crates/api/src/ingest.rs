//! Batch ingest
//!
//! Admits a batch of event documents inside one database transaction: parse,
//! privacy gate, idempotent raw insert, then outbox staging per routing key.
//! Either the raw row and all of its outbox rows land together, or neither
//! does.

use serde::Serialize;
use serde_json::Value;
use smartbuket_core::{CoreConfig, parse_event, privacy, routing::routing_keys};
use sqlx::PgPool;
use std::collections::HashSet;
use utoipa::ToSchema;
use uuid::Uuid;

/// Per-document rejection reason.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RejectedDocument {
    /// Position in the submitted batch
    pub index: usize,
    /// Rejection reason (`opt_out` or an envelope validation message)
    pub error: String,
}

/// Outcome of one ingest batch.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestOutcome {
    pub accepted: u64,
    pub deduped: u64,
    pub rejected: Vec<RejectedDocument>,
}

const INSERT_RAW_SQL: &str = r#"
INSERT INTO raw_events (
    event_id, trace_id, producer, actor,
    app_uuid, event_type, event_ts,
    anon_user_id, device_id_hash, session_id,
    sdk_version, event_version,
    geo_point, geo_accuracy_m, geo_source,
    payload, context, raw_doc
)
VALUES (
    $1, $2, $3, $4,
    $5, $6, $7,
    $8, $9, $10,
    $11, $12,
    CASE WHEN $13::double precision IS NULL OR $14::double precision IS NULL THEN NULL
         ELSE ST_SetSRID(ST_MakePoint($14, $13), 4326) END,
    $15, $16,
    $17, $18, $19
)
ON CONFLICT (app_uuid, event_id) DO NOTHING
"#;

const INSERT_OUTBOX_SQL: &str = r#"
INSERT INTO outbox_events (
    app_uuid, event_id, trace_id, occurred_at,
    routing_key, payload
)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (app_uuid, event_id, routing_key) DO NOTHING
"#;

/// Admit a batch of documents. The whole batch runs in one transaction; a
/// database error rolls everything back and surfaces to the caller, while
/// per-document envelope failures only reject that document.
pub async fn ingest_batch(
    pool: &PgPool,
    config: &CoreConfig,
    docs: &[Value],
) -> sqlx::Result<IngestOutcome> {
    let mut tx = pool.begin().await?;

    let mut accepted = 0;
    let mut deduped = 0;
    let mut rejected = Vec::new();

    // Amortizes opt-out lookups across the batch; lives only as long as the
    // transaction it fronts.
    let mut opted_out_cache: HashSet<(Uuid, String)> = HashSet::new();

    for (index, doc) in docs.iter().enumerate() {
        let event = match parse_event(doc, config.parse_mode()) {
            Ok(event) => event,
            Err(err) => {
                rejected.push(RejectedDocument {
                    index,
                    error: err.to_string(),
                });
                continue;
            }
        };

        let cache_key = (event.app_uuid, event.anon_user_id.clone());
        if opted_out_cache.contains(&cache_key)
            || privacy::is_opted_out(&mut *tx, event.app_uuid, &event.anon_user_id).await?
        {
            opted_out_cache.insert(cache_key);
            rejected.push(RejectedDocument {
                index,
                error: "opt_out".to_string(),
            });
            continue;
        }

        // Geo columns are derived from context.geo when present; the point
        // needs both coordinates, accuracy and source stand on their own.
        let geo = event.context.get("geo").and_then(Value::as_object);
        let lat = geo.and_then(|g| g.get("lat")).and_then(Value::as_f64);
        let lon = geo.and_then(|g| g.get("lon")).and_then(Value::as_f64);
        let accuracy_m = geo.and_then(|g| g.get("accuracy_m")).and_then(Value::as_f64);
        let geo_source = geo
            .and_then(|g| g.get("source"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let inserted = sqlx::query(INSERT_RAW_SQL)
            .bind(event.event_id)
            .bind(event.trace_id)
            .bind(&event.producer)
            .bind(&event.actor)
            .bind(event.app_uuid)
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(&event.anon_user_id)
            .bind(&event.device_id_hash)
            .bind(&event.session_id)
            .bind(&event.sdk_version)
            .bind(&event.event_version)
            .bind(lat)
            .bind(lon)
            .bind(accuracy_m)
            .bind(geo_source)
            .bind(Value::Object(event.payload.clone()))
            .bind(Value::Object(event.context.clone()))
            .bind(doc)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Admission-side idempotency fence: a replay stages no outbox rows.
        if inserted == 0 {
            deduped += 1;
            continue;
        }

        let wire = event.wire_payload(doc);
        for routing_key in routing_keys(&event.event_type, &config.topics) {
            sqlx::query(INSERT_OUTBOX_SQL)
                .bind(event.app_uuid)
                .bind(event.event_id)
                .bind(event.trace_id)
                .bind(event.timestamp)
                .bind(&routing_key)
                .bind(&wire)
                .execute(&mut *tx)
                .await?;
        }

        accepted += 1;
    }

    tx.commit().await?;

    Ok(IngestOutcome {
        accepted,
        deduped,
        rejected,
    })
}
