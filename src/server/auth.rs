//! Shared-secret authentication for gateway endpoints.
//!
//! A single API key compared against the `X-API-Key` header. With no key
//! configured every request passes.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Validates requests against an optional shared API key.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    api_key: Option<String>,
}

impl ApiKeyAuth {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.is_empty()),
        }
    }

    /// True when the request may proceed.
    pub fn validate(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|key| key == expected)
    }

    /// The canonical `401` response for a missing or wrong key.
    pub fn unauthorized_response(&self) -> Response {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": 401,
                "message": "Unauthorized: Invalid or missing API key",
            },
        });
        (
            StatusCode::UNAUTHORIZED,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_key_configured_allows_everything() {
        let auth = ApiKeyAuth::new(None);
        assert!(auth.validate(&HeaderMap::new()));

        // The empty string means "not configured", mirroring an empty flag.
        let auth = ApiKeyAuth::new(Some(String::new()));
        assert!(auth.validate(&HeaderMap::new()));
    }

    #[test]
    fn key_must_match_exactly() {
        let auth = ApiKeyAuth::new(Some("secret".to_string()));

        let mut headers = HeaderMap::new();
        assert!(!auth.validate(&headers));

        headers.insert(API_KEY_HEADER, "wrong".parse().unwrap());
        assert!(!auth.validate(&headers));

        headers.insert(API_KEY_HEADER, "secret".parse().unwrap());
        assert!(auth.validate(&headers));
    }
}
