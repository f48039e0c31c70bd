// Request metadata and body extractors shared by handlers and middleware

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request},
    http::{
        header::USER_AGENT,
        request::Parts,
        Extensions, HeaderMap,
    },
    Json,
};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::api::routes::AppState;
use crate::domain::RequestContext;
use crate::errors::AppError;

const UNKNOWN: &str = "unknown";

/// Source address of the caller.
///
/// Forwarded headers are honored only when the service sits behind a trusted
/// proxy; otherwise the socket peer is used.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

pub fn request_context(
    headers: &HeaderMap,
    extensions: &Extensions,
    trust_forwarded: bool,
) -> RequestContext {
    if let Some(context) = extensions.get::<RequestContext>() {
        return context.clone();
    }

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(UNKNOWN);
    RequestContext::new(client_ip(headers, extensions, trust_forwarded), user_agent)
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(request_context(
            &parts.headers,
            &parts.extensions,
            state.config.security.trust_forwarded_headers,
        ))
    }
}

/// `Json` with rejections rendered in the service's error format.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state)
            .await
            .map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;
        Ok(JsonBody(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn extensions_with_peer(addr: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        extensions
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(client_ip(&headers, &Extensions::new(), true), "192.168.1.1");
    }

    #[test]
    fn test_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.42"));
        assert_eq!(client_ip(&headers, &Extensions::new(), true), "203.0.113.42");
    }

    #[test]
    fn test_untrusted_headers_use_socket_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6"));
        let extensions = extensions_with_peer("198.51.100.20:41000");
        assert_eq!(client_ip(&headers, &extensions, false), "198.51.100.20");
        assert_eq!(client_ip(&headers, &Extensions::new(), false), "unknown");
    }

    #[test]
    fn test_context_carries_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("payments-sdk/2.1"));
        let context = request_context(&headers, &extensions_with_peer("10.0.0.5:80"), false);
        assert_eq!(context, RequestContext::new("10.0.0.5", "payments-sdk/2.1"));
    }
}
