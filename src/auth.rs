//! API key authentication middleware for the coinproxy HTTP server.
//!
//! When API keys are configured, proxy routes require a valid key in the
//! `X-API-Key` header. When no keys are configured, all requests pass through.
//! Either way the caller ends up with an opaque [`CallerId`] in the request
//! extensions; the proxy core only logs it.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::server::ErrorBody;

/// Shared set of valid API keys.
pub type ApiKeySet = Arc<HashSet<String>>;

/// Opaque identity of the caller, supplied by the access layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    /// Identity derived from an API key; only a short prefix is kept so the
    /// key itself never reaches the logs.
    fn from_key(key: &str) -> Self {
        let prefix: String = key.chars().take(4).collect();
        Self(format!("key:{prefix}…"))
    }
}

/// Axum middleware that checks for a valid API key in the `X-API-Key` header.
///
/// If the key set is empty, all requests are allowed (no auth mode).
/// Otherwise, requests without a valid key receive 401 Unauthorized.
pub async fn require_api_key(
    State(keys): State<ApiKeySet>,
    mut request: Request,
    next: Next,
) -> Response {
    // No keys configured = pass-through
    if keys.is_empty() {
        request.extensions_mut().insert(CallerId::anonymous());
        return next.run(request).await;
    }

    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match api_key {
        Some(key) if keys.contains(&key) => {
            request.extensions_mut().insert(CallerId::from_key(&key));
            next.run(request).await
        }
        Some(_) => {
            tracing::warn!("invalid API key provided");
            unauthorized()
        }
        None => {
            tracing::warn!("missing X-API-Key header");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(ErrorBody::new("missing or invalid API key")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_id_hides_key() {
        let id = CallerId::from_key("secret-key-123");
        assert_eq!(id.0, "key:secr…");
        assert!(!id.0.contains("secret-key"));
    }
}
