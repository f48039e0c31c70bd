use axum::{
    extract::{MatchedPath, Request, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::api::extract::request_context;
use crate::api::routes::AppState;
use crate::auth::ValidatedIdentity;
use crate::errors::AppError;
use crate::rate_limit::limiter::{Dimension, RateLimitDecision};

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const RETRY_AFTER_HEADER: HeaderName = HeaderName::from_static("retry-after");

/// Per source address limit.
pub async fn ip_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let source_ip = request_context(
        request.headers(),
        request.extensions(),
        state.config.security.trust_forwarded_headers,
    )
    .source_ip;
    enforce(&state, Dimension::Ip, &source_ip, request, next).await
}

/// Per route template limit, shared by all callers of that route.
pub async fn endpoint_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = match request.extensions().get::<MatchedPath>() {
        Some(path) => format!("{} {}", request.method(), path.as_str()),
        None => format!("{} {}", request.method(), request.uri().path()),
    };
    enforce(&state, Dimension::Endpoint, &endpoint, request, next).await
}

/// Per authenticated account limit. Runs after authentication.
pub async fn account_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(account_id) = request
        .extensions()
        .get::<ValidatedIdentity>()
        .map(|identity| identity.account_id.to_string())
    else {
        return next.run(request).await;
    };
    enforce(&state, Dimension::Account, &account_id, request, next).await
}

async fn enforce(
    state: &AppState,
    dimension: Dimension,
    identifier: &str,
    request: Request,
    next: Next,
) -> Response {
    let Some(decision) = state.limiter.check(dimension, identifier).await else {
        return next.run(request).await;
    };

    if !decision.allowed {
        return rejection(&decision);
    }

    let mut response = next.run(request).await;
    add_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn rejection(decision: &RateLimitDecision) -> Response {
    let error = AppError::RateLimitExceeded;
    let body = Json(json!({
        "error": error.code(),
        "message": error.to_string(),
        "limit": decision.limit,
        "window_seconds": decision.window.num_seconds(),
        "reset_time": decision.reset_at.timestamp(),
        "retry_after": decision.retry_after_seconds(),
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    add_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// Sets the `X-RateLimit-*` headers, keeping whichever layer has the least
/// headroom when several limits apply to one request.
fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let tighter_already_set = headers
        .get(&REMAINING_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|existing| existing < decision.remaining);
    if tighter_already_set {
        return;
    }

    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_at.timestamp()));

    if !decision.allowed {
        headers.insert(
            RETRY_AFTER_HEADER,
            HeaderValue::from(decision.retry_after_seconds()),
        );
    }
}
