//! HTTP surface: webhook intake, review actions, and admin operations.

mod admin;
mod auth;
mod review;
mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::SecretString;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::PipelineError;
use crate::pipeline::PipelineCoordinator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineCoordinator>,
    /// Bearer token for `/admin/*` and `/review/*`. `None` disables them.
    pub admin_secret: Option<Arc<SecretString>>,
    /// Background webhook processing. Drained on shutdown.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(pipeline: Arc<PipelineCoordinator>, admin_secret: Option<SecretString>) -> Self {
        Self {
            pipeline,
            admin_secret: admin_secret.map(Arc::new),
            tasks: TaskTracker::new(),
        }
    }
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let operator = Router::new()
        .route("/review/drafts", get(review::list_pending))
        .route("/review/drafts/{id}/approve", post(review::approve))
        .route("/review/drafts/{id}/reject", post(review::reject))
        .route("/review/drafts/{id}/regenerate", post(review::regenerate))
        .route("/admin/backfill-history-roles", post(admin::backfill))
        .route("/admin/expire-stale-drafts", post(admin::expire_stale))
        .route("/admin/retry-failed-drafts", post(admin::retry_failed))
        .route("/admin/conversations/{external_id}", get(admin::conversation))
        .route("/admin/conversations/{external_id}/stage", post(admin::override_stage))
        .route("/admin/resources", post(admin::upsert_resource))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    Router::new()
        .route("/health", get(health))
        .route("/webhook/inbound", post(webhooks::inbound))
        .route("/webhook/outbound", post(webhooks::outbound))
        .merge(operator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "speed-to-lead"
    }))
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

/// Map a pipeline failure onto a status code.
fn pipeline_error(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::ConversationNotFound(_) | PipelineError::DraftNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        PipelineError::DraftNotPending { .. } => StatusCode::CONFLICT,
        PipelineError::NothingToReply(_) | PipelineError::Ingest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::Database(_) | PipelineError::Generation(_) => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, err.to_string())
}

fn parse_id(raw: &str) -> Result<uuid::Uuid, Response> {
    uuid::Uuid::parse_str(raw).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid draft ID"))
}
