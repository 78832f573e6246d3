//! Event ingest endpoint

use crate::{AppState, error::ApiError, ingest};
use axum::{Json, Router, extract::State, routing::post};
use serde_json::Value;

/// Ingest a batch of events
///
/// Body is a non-empty JSON array of event documents. Parsing failures and
/// opted-out users reject individual documents; the rest of the batch is
/// admitted in one transaction.
#[utoipa::path(
    post,
    path = "/v1/events",
    responses(
        (status = 200, description = "Batch outcome", body = ingest::IngestOutcome),
        (status = 400, description = "Body is not a non-empty array")
    ),
    tag = "ingest"
)]
async fn ingest_events(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ingest::IngestOutcome>, ApiError> {
    let docs = body
        .as_array()
        .filter(|docs| !docs.is_empty())
        .ok_or_else(|| ApiError::BadRequest("body must be a non-empty list".to_string()))?;

    let outcome = ingest::ingest_batch(&state.pool, &state.config, docs).await?;

    tracing::debug!(
        accepted = outcome.accepted,
        deduped = outcome.deduped,
        rejected = outcome.rejected.len(),
        "ingest batch processed"
    );

    Ok(Json(outcome))
}

/// Ingest routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/events", post(ingest_events))
}
