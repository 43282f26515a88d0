use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::http::ApiError;
use crate::state::AppState;

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let rest = raw.trim().strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Browsers can't set headers on a WebSocket handshake, so `access_token` in the
/// query string is accepted too.
fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "access_token")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Constant-time comparison so a token can't be guessed byte by byte.
fn token_matches(got: &str, expected: &str) -> bool {
    if got.len() != expected.len() {
        return false;
    }
    got.bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn auth_ok(expected: Option<&str>, headers: &HeaderMap, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    bearer_token(headers)
        .or_else(|| query_token(query))
        .is_some_and(|got| token_matches(&got, expected))
}

// Middleware: static bearer token + read-only switch for every /api route.
pub async fn guard(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let config = &state.config;
    if !auth_ok(config.api_token.as_deref(), req.headers(), req.uri().query()) {
        return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid token")
            .into_response();
    }
    if config.read_only && is_unsafe_method(req.method()) {
        return ApiError::new(
            StatusCode::FORBIDDEN,
            "read_only",
            "control plane is in read-only mode",
        )
        .into_response();
    }
    next.run(req).await
}
