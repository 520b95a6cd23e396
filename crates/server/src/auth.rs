//! Optional auth token middleware.
//!
//! When `--auth-token` is configured, all requests to `/ws` must carry
//! `Authorization: Bearer <token>` (or `?token=<token>` for WebSocket
//! clients that cannot set headers). `/health` stays unauthenticated.
//! The identity check itself is delegated; the server only compares
//! against the configured shared token.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if presented_tokens(&req).any(|token| token == expected_token) {
        return Ok(next.run(req).await);
    }

    debug!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Rejected request without valid token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

/// All candidate tokens on a request: the bearer header, then any
/// `token=` query parameters.
fn presented_tokens(req: &Request<Body>) -> impl Iterator<Item = &str> {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let query = req
        .uri()
        .query()
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.strip_prefix("token="));

    bearer.into_iter().chain(query)
}
