//! Bearer authentication and request auditing.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::{json_error, AppState};

/// Constant-time token equality. A length mismatch returns false without
/// comparing contents.
pub fn token_eq(provided: &[u8], expected: &[u8]) -> bool {
    provided.ct_eq(expected).into()
}

/// Reject requests without a valid `Authorization: Bearer <token>` header:
/// 401 when the header is missing or malformed, 403 when the token does
/// not match.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = bearer else {
        return json_error(StatusCode::UNAUTHORIZED, "missing authorization");
    };
    if !token_eq(token.as_bytes(), &state.token) {
        return json_error(StatusCode::FORBIDDEN, "invalid token");
    }

    next.run(request).await
}

/// One audit line per request. Mounted inside the auth layer, so only
/// authenticated requests are recorded.
pub async fn audit(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        target: "audit",
        %method,
        path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}
