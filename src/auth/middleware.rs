use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::api::extract::request_context;
use crate::api::routes::AppState;
use crate::errors::Result;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Pulls the presented secret out of the request headers.
///
/// The dedicated header wins over `Authorization: Bearer`; blank values count
/// as absent.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = authorization.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Authentication middleware for protected routes.
///
/// On success the caller's `ValidatedIdentity` is placed in the request
/// extensions for the account rate limit, idempotency and handlers.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let context = request_context(
        request.headers(),
        request.extensions(),
        state.config.security.trust_forwarded_headers,
    );
    let raw = extract_api_key(request.headers());

    let identity = state
        .authenticator
        .identify(raw.as_deref(), &context)
        .await?;

    request.extensions_mut().insert(context);
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_dedicated_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-dedicated"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-dedicated"));
    }

    #[test]
    fn test_bearer_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  abc123 "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc123"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("   "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_other_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_api_key(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(extract_api_key(&headers), None);

        assert_eq!(extract_api_key(&HeaderMap::new()), None);
    }
}
