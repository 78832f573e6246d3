//! End-to-end ingest API flow against a real database: admission, dedupe,
//! opt-out gating and privacy deletion through the HTTP surface.

use api::{AppState, create_router};
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use smartbuket_core::CoreConfig;
use smartbuket_core::config::Topics;
use sqlx::PgPool;
use tower::ServiceExt;

const APP_UUID: &str = "00000000-0000-0000-0000-000000000001";

fn test_core_config() -> CoreConfig {
    CoreConfig {
        database_url: "unused".to_string(),
        db_max_connections: 5,
        rabbitmq_url: "amqp://localhost".to_string(),
        rabbitmq_exchange: "sb.events".to_string(),
        topics: Topics::default(),
        strict_envelope: false,
        processor_group_id: "sb-processor".to_string(),
        processor_max_retries: 5,
        processor_retry_base_seconds: 0.5,
        processor_retry_max_seconds: 10.0,
        h3_resolutions: vec![7, 9, 11],
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn response_json(response: axum::http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn geo_ping_batch() -> Value {
    json!([{
        "app_uuid": APP_UUID,
        "event_id": "11111111-1111-1111-1111-111111111111",
        "event_type": "geo.ping",
        "timestamp": "2024-01-01T12:30:00Z",
        "anon_user_id": "u1",
        "device_id_hash": "d1",
        "session_id": "s1",
        "sdk_version": "1",
        "event_version": "1",
        "payload": {},
        "context": {"geo": {"lat": 18.4861, "lon": -69.9312, "accuracy_m": 25, "source": "gps"}},
    }])
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_ingest_full_flow(pool: PgPool) {
    let state = AppState {
        pool: pool.clone(),
        config: test_core_config(),
    };
    let app = create_router(state);

    // 1. Happy path: one geo ping is accepted and staged.
    let response = app
        .clone()
        .oneshot(post_json("/v1/events", geo_ping_batch()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outcome = response_json(response).await;
    assert_eq!(outcome["accepted"], json!(1));
    assert_eq!(outcome["deduped"], json!(0));

    let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(outbox, 2);

    // 2. Resubmission dedupes without staging more outbox rows.
    let response = app
        .clone()
        .oneshot(post_json("/v1/events", geo_ping_batch()))
        .await
        .unwrap();
    let outcome = response_json(response).await;
    assert_eq!(outcome["accepted"], json!(0));
    assert_eq!(outcome["deduped"], json!(1));

    let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(outbox, 2);

    // 3. Opt-out, then further events for the pair are rejected.
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/opt-out",
            json!({"app_uuid": APP_UUID, "anon_user_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut batch = geo_ping_batch();
    batch[0]["event_id"] = json!("22222222-2222-2222-2222-222222222222");
    let response = app
        .clone()
        .oneshot(post_json("/v1/events", batch))
        .await
        .unwrap();
    let outcome = response_json(response).await;
    assert_eq!(outcome["accepted"], json!(0));
    assert_eq!(outcome["rejected"][0]["index"], json!(0));
    assert_eq!(outcome["rejected"][0]["error"], json!("opt_out"));

    // 4. Privacy delete reports per-table counts.
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/privacy/delete",
            json!({"app_uuid": APP_UUID, "anon_user_id": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let outcome = response_json(response).await;
    assert_eq!(outcome["deleted"]["raw_events"], json!(1));
    assert_eq!(outcome["deleted"]["customer_360"], json!(0));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_empty_batch_is_rejected(pool: PgPool) {
    let state = AppState {
        pool,
        config: test_core_config(),
    };
    let app = create_router(state);

    let response = app
        .clone()
        .oneshot(post_json("/v1/events", json!([])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json("/v1/events", json!({"not": "a list"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_opt_out_requires_both_fields(pool: PgPool) {
    let state = AppState {
        pool,
        config: test_core_config(),
    };
    let app = create_router(state);

    let response = app
        .oneshot(post_json("/v1/opt-out", json!({"app_uuid": APP_UUID})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
