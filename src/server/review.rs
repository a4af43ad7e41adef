//! Review actions on drafts.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{AppState, parse_id, pipeline_error};

pub(super) async fn list_pending(State(state): State<AppState>) -> Response {
    match state.pipeline.pending_drafts().await {
        Ok(drafts) => Json(drafts).into_response(),
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn approve(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let draft_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.pipeline.approve(draft_id).await {
        Ok(draft) => {
            info!(%draft_id, "Draft approved");
            (StatusCode::OK, Json(serde_json::json!(draft))).into_response()
        }
        Err(e) => pipeline_error(e),
    }
}

pub(super) async fn reject(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let draft_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.pipeline.reject(draft_id).await {
        Ok(draft) => {
            info!(%draft_id, "Draft rejected");
            (StatusCode::OK, Json(serde_json::json!(draft))).into_response()
        }
        Err(e) => pipeline_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct RegenerateRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// The body is optional; an empty request regenerates without guidance.
pub(super) async fn regenerate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RegenerateRequest>>,
) -> Response {
    let draft_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let reason = body.and_then(|Json(b)| b.reason);
    match state.pipeline.regenerate(draft_id, reason).await {
        Ok(outcome) => (StatusCode::OK, Json(serde_json::json!(outcome))).into_response(),
        Err(e) => pipeline_error(e),
    }
}
