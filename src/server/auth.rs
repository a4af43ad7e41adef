//! Bearer-token gate for operator routes (`/admin/*`, `/review/*`).
//!
//! Fails closed: with no secret configured every gated request gets 503.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use tracing::warn;

use super::{AppState, error_body};

pub(super) async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = state.admin_secret.as_deref() else {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator routes are disabled",
        );
    };
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), secret.expose_secret().as_bytes()) => {
            next.run(request).await
        }
        _ => {
            warn!(path = %request.uri().path(), "Operator request with missing or wrong token");
            error_body(StatusCode::UNAUTHORIZED, "Unauthorized")
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
