//! Privacy endpoints: opt-out and user data deletion

use crate::{AppState, error::ApiError};
use axum::{Json, Router, extract::State, routing::post};
use serde::Serialize;
use serde_json::Value;
use smartbuket_core::privacy;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Opt-out confirmation
#[derive(Debug, Serialize, ToSchema)]
pub struct OptOutResponse {
    pub status: String,
}

/// Outcome of a privacy deletion
#[derive(Debug, Serialize, ToSchema)]
pub struct PrivacyDeleteResponse {
    pub status: String,
    pub app_uuid: Uuid,
    pub anon_user_id: String,
    #[schema(value_type = Object)]
    pub deleted: BTreeMap<&'static str, u64>,
}

fn identity_from(body: &Value) -> Result<(Uuid, String), ApiError> {
    let app_uuid = body.get("app_uuid").and_then(Value::as_str);
    let anon_user_id = body.get("anon_user_id").and_then(Value::as_str);

    let (Some(app_uuid), Some(anon_user_id)) = (app_uuid, anon_user_id) else {
        return Err(ApiError::BadRequest(
            "app_uuid and anon_user_id are required".to_string(),
        ));
    };

    let app_uuid = Uuid::parse_str(app_uuid)
        .map_err(|_| ApiError::BadRequest("app_uuid must be a valid UUID".to_string()))?;

    Ok((app_uuid, anon_user_id.to_string()))
}

/// Record an opt-out
///
/// Opt-out blocks further admission and processing for the pair. It does not
/// delete already stored rows; use the privacy delete endpoint for that.
#[utoipa::path(
    post,
    path = "/v1/opt-out",
    responses(
        (status = 200, description = "Opt-out recorded", body = OptOutResponse),
        (status = 400, description = "Missing app_uuid or anon_user_id")
    ),
    tag = "privacy"
)]
async fn opt_out(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<OptOutResponse>, ApiError> {
    let (app_uuid, anon_user_id) = identity_from(&body)?;

    privacy::record_opt_out(&state.pool, app_uuid, &anon_user_id).await?;

    Ok(Json(OptOutResponse {
        status: "ok".to_string(),
    }))
}

/// Delete all stored data for a user within an app
///
/// Deletes database state only; broker messages already published are
/// append-only and stay. Pass `delete_opt_out: true` to drop the opt-out
/// record as well.
#[utoipa::path(
    post,
    path = "/v1/privacy/delete",
    responses(
        (status = 200, description = "Per-table delete counts", body = PrivacyDeleteResponse),
        (status = 400, description = "Missing app_uuid or anon_user_id")
    ),
    tag = "privacy"
)]
async fn privacy_delete(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<PrivacyDeleteResponse>, ApiError> {
    let (app_uuid, anon_user_id) = identity_from(&body)?;
    let delete_opt_out = body
        .get("delete_opt_out")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let deleted =
        privacy::delete_user_data(&state.pool, app_uuid, &anon_user_id, delete_opt_out).await?;

    tracing::info!(%app_uuid, %anon_user_id, ?deleted, "privacy delete executed");

    Ok(Json(PrivacyDeleteResponse {
        status: "ok".to_string(),
        app_uuid,
        anon_user_id,
        deleted,
    }))
}

/// Privacy routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/opt-out", post(opt_out))
        .route("/v1/privacy/delete", post(privacy_delete))
}
