use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{error, warn};

use crate::api::routes::AppState;
use crate::auth::ValidatedIdentity;
use crate::domain::CachedResponse;
use crate::errors::{AppError, Result};
use crate::idempotency::fingerprint::{
    extract_idempotency_key, RequestFingerprint, MAX_IDEMPOTENCY_KEY_LEN,
};
use crate::idempotency::ledger::Begin;

pub const REPLAYED_HEADER: &str = "idempotency-replayed";

/// Largest request or response body buffered for fingerprinting and caching.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// JSON field carrying a freshly minted raw secret. Never cached.
const SECRET_FIELD: &str = "api_key";

/// Deduplicates writes that carry an idempotency token.
///
/// Safe methods and requests without a token pass straight through. A handler
/// response with a 5xx status releases the claim so the client can retry;
/// anything else is cached and replayed for the retention window, minus any
/// raw secret it contained.
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if request.method().is_safe() {
        return Ok(next.run(request).await);
    }
    let Some(token) = extract_idempotency_key(request.headers()) else {
        return Ok(next.run(request).await);
    };
    if token.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::InvalidRequest(format!(
            "idempotency key must be at most {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }

    let account_id = request
        .extensions()
        .get::<ValidatedIdentity>()
        .map(|identity| identity.account_id);

    let (parts, body) = request.into_parts();
    let body: Bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::InvalidRequest("request body too large".to_string()))?;

    let fingerprint = RequestFingerprint {
        account_id,
        method: &parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| parts.uri.path()),
        content_type: parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        idempotency_key: &token,
        body: &body,
    }
    .digest();

    let record = match state.ledger.begin(account_id, fingerprint).await? {
        Begin::Replay(cached) => return Ok(replay(cached)),
        Begin::Started(record) => record,
    };

    let response = next.run(Request::from_parts(parts, body.into())).await;

    if response.status().is_server_error() {
        if let Err(e) = state.ledger.abandon(record.id).await {
            warn!(record_id = %record.id, error = %e, "Failed to release idempotency record");
        }
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body: Bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            error!(record_id = %record.id, error = %e, "Failed to buffer response for caching");
            let _ = state.ledger.abandon(record.id).await;
            return Err(AppError::Internal("response could not be buffered".to_string()));
        }
    };

    let cached = CachedResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: redact_secrets(&body),
    };
    if let Err(e) = state.ledger.complete(record.id, &cached).await {
        // The handler already ran; the client still gets its answer.
        error!(record_id = %record.id, error = %e, "Failed to complete idempotency record");
    }

    Ok(Response::from_parts(parts, Body::from(body)))
}

/// Body text safe to persist: every string-valued `api_key` field is removed,
/// at any depth. Non-JSON bodies are kept as they are.
fn redact_secrets(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(mut value) => {
            strip_secret_fields(&mut value);
            value.to_string()
        }
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

fn strip_secret_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get(SECRET_FIELD).is_some_and(Value::is_string) {
                map.remove(SECRET_FIELD);
            }
            map.values_mut().for_each(strip_secret_fields);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_secret_fields),
        _ => {}
    }
}

fn replay(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    if let Some(content_type) = cached
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_restores_status_and_body() {
        let response = replay(CachedResponse {
            status: 201,
            content_type: Some("application/json".to_string()),
            body: r#"{"ok":true}"#.to_string(),
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[REPLAYED_HEADER], "true");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    #[test]
    fn test_cached_body_drops_raw_secrets() {
        let issued = br#"{"api_key":"3f9a","api_key_id":"k1","name":"payouts"}"#;
        let cached: Value = serde_json::from_str(&redact_secrets(issued)).unwrap();
        assert!(cached.get("api_key").is_none());
        assert_eq!(cached["api_key_id"], "k1");

        let registered = br#"{"account":{"name":"Acme"},"api_key":{"api_key":"3f9a","name":"bootstrap"}}"#;
        let cached: Value = serde_json::from_str(&redact_secrets(registered)).unwrap();
        assert!(cached["api_key"].get("api_key").is_none());
        assert_eq!(cached["api_key"]["name"], "bootstrap");
        assert_eq!(cached["account"]["name"], "Acme");
    }

    #[test]
    fn test_non_json_body_is_cached_verbatim() {
        assert_eq!(redact_secrets(b"plain text"), "plain text");
    }
}
