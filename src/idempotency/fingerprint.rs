use axum::http::{HeaderMap, Method};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENCY_KEY_HEADER_LEGACY: &str = "x-idempotency-key";
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Client-chosen token, `Idempotency-Key` first then the `X-` alias.
pub fn extract_idempotency_key(headers: &HeaderMap) -> Option<String> {
    [IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_KEY_HEADER_LEGACY]
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Everything that makes two requests "the same logical write".
#[derive(Debug, Clone, Copy)]
pub struct RequestFingerprint<'a> {
    pub account_id: Option<Uuid>,
    pub method: &'a Method,
    pub path_and_query: &'a str,
    pub content_type: Option<&'a str>,
    pub idempotency_key: &'a str,
    pub body: &'a [u8],
}

impl RequestFingerprint<'_> {
    /// Hex SHA-256 over length-prefixed fields.
    pub fn digest(&self) -> String {
        let account = self.account_id.map(|id| id.to_string()).unwrap_or_default();
        let mut hasher = Sha256::new();
        for field in [
            account.as_bytes(),
            self.method.as_str().as_bytes(),
            self.path_and_query.as_bytes(),
            self.content_type.unwrap_or_default().as_bytes(),
            self.idempotency_key.as_bytes(),
            self.body,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn base<'a>(body: &'a [u8], key: &'a str) -> RequestFingerprint<'a> {
        RequestFingerprint {
            account_id: None,
            method: &Method::POST,
            path_and_query: "/v1/api-keys",
            content_type: Some("application/json"),
            idempotency_key: key,
            body,
        }
    }

    #[test]
    fn test_same_request_same_fingerprint() {
        let a = base(br#"{"name":"ops"}"#, "tok-1").digest();
        let b = base(br#"{"name":"ops"}"#, "tok-1").digest();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_any_component_changes_fingerprint() {
        let reference = base(b"{}", "tok-1").digest();

        assert_ne!(reference, base(b"{}", "tok-2").digest());
        assert_ne!(reference, base(b"{ }", "tok-1").digest());

        let mut other_account = base(b"{}", "tok-1");
        other_account.account_id = Some(Uuid::new_v4());
        assert_ne!(reference, other_account.digest());

        let mut other_path = base(b"{}", "tok-1");
        other_path.path_and_query = "/v1/accounts";
        assert_ne!(reference, other_path.digest());
    }

    #[test]
    fn test_fields_do_not_bleed_into_each_other() {
        let mut a = base(b"", "ab");
        a.path_and_query = "/x";
        let mut b = base(b"", "b");
        b.path_and_query = "/xa";
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_header_aliases() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_idempotency_key(&headers), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER_LEGACY, HeaderValue::from_static("legacy"));
        assert_eq!(extract_idempotency_key(&headers).as_deref(), Some("legacy"));

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("primary"));
        assert_eq!(extract_idempotency_key(&headers).as_deref(), Some("primary"));

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("  "));
        assert_eq!(extract_idempotency_key(&headers).as_deref(), Some("legacy"));
    }
}
