//! Administrative operations. Routed behind `auth::require_bearer`.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{AppState, error_body, pipeline_error};
use crate::context::ResourceDoc;
use crate::stage::FunnelStage;

pub(super) async fn backfill(State(state): State<AppState>) -> Response {
    match state.pipeline.backfill().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn expire_stale(State(state): State<AppState>) -> Response {
    match state.pipeline.expire_stale().await {
        Ok(expired) => (StatusCode::OK, Json(serde_json::json!({"expired": expired}))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn retry_failed(State(state): State<AppState>) -> Response {
    match state.pipeline.retry_failed().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn conversation(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.pipeline.conversation_detail(&external_id).await {
        Ok(detail) => (StatusCode::OK, Json(serde_json::json!(detail))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct StageOverride {
    stage: String,
}

pub(super) async fn override_stage(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(body): Json<StageOverride>,
) -> Response {
    let stage: FunnelStage = match body.stage.parse() {
        Ok(stage) => stage,
        Err(e) => return error_body(StatusCode::UNPROCESSABLE_ENTITY, e),
    };
    match state.pipeline.override_stage(&external_id, stage).await {
        Ok(conversation) => (StatusCode::OK, Json(serde_json::json!(conversation))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn upsert_resource(
    State(state): State<AppState>,
    Json(doc): Json<ResourceDoc>,
) -> Response {
    if doc.id.trim().is_empty() || doc.content.trim().is_empty() {
        return error_body(StatusCode::UNPROCESSABLE_ENTITY, "Resource needs an id and content");
    }
    match state.pipeline.upsert_resource(&doc).await {
        Ok(()) => {
            info!(resource = %doc.id, stages = doc.stages.len(), "Resource stored");
            (StatusCode::OK, Json(serde_json::json!({"status": "stored", "id": doc.id}))).into_response()
        }
        Err(e) => pipeline_error(e),
    }
}
