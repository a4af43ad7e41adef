//! Webhook intake.
//!
//! Payloads are normalized before responding so malformed deliveries get a
//! 422. Accepted events are processed in the background and answered with
//! 202, keeping the upstream platform's delivery timeout out of the LLM path.
//! Background work goes through the state's `TaskTracker` so shutdown can
//! wait for it.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{info, warn};

use super::{AppState, error_body};
use crate::ingest::normalize;
use crate::pipeline::WebhookKind;

pub(super) async fn inbound(State(state): State<AppState>, body: Bytes) -> Response {
    accept(state, WebhookKind::Inbound, &body)
}

pub(super) async fn outbound(State(state): State<AppState>, body: Bytes) -> Response {
    accept(state, WebhookKind::Outbound, &body)
}

fn accept(state: AppState, kind: WebhookKind, body: &[u8]) -> Response {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(?kind, error = %e, "Webhook body is not JSON");
            return error_body(StatusCode::UNPROCESSABLE_ENTITY, format!("Malformed payload: {e}"));
        }
    };
    let event = match normalize(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(?kind, error = %e, "Webhook rejected");
            return error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };

    let conversation = event.external_conversation_id.clone();
    let messages = event.messages.len();
    info!(?kind, %conversation, messages, "Webhook accepted");

    let response = (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "conversation_id": conversation,
            "messages": messages,
        })),
    )
        .into_response();

    let pipeline = state.pipeline.clone();
    state.tasks.spawn(async move {
        match pipeline.handle_event(kind, event).await {
            Ok(outcome) => info!(%conversation, ?outcome, "Webhook processed"),
            Err(e) => warn!(%conversation, error = %e, "Webhook processing failed"),
        }
    });

    response
}
