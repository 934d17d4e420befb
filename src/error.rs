//! Error taxonomy for the proxy core.
//!
//! Lower layers return [`ProxyError`]; only the HTTP layer turns a variant into
//! a status code and a client-facing message.

use thiserror::Error;

/// Errors produced by the upstream client, the normalizer and the dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Missing or malformed request parameters. Never retried and never
    /// reported as a system fault.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The provider could not be reached, timed out, or answered with a
    /// non-2xx status.
    #[error("upstream unavailable{}: {reason}", status_suffix(.status))]
    UpstreamUnavailable {
        /// Upstream HTTP status, when one was received.
        status: Option<u16>,
        reason: String,
    },

    /// The provider answered 2xx but the payload is missing expected fields or
    /// is not JSON at all.
    #[error("malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),
}

impl ProxyError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn unavailable(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            status,
            reason: reason.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedUpstreamResponse(msg.into())
    }

    /// Whether this error comes from the provider side (unavailable or
    /// malformed), which makes it eligible for stale serving.
    pub fn is_upstream_failure(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }

    /// Whether a retry could plausibly succeed: no status (network error or
    /// timeout), 429, or any 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UpstreamUnavailable { status: None, .. } => true,
            Self::UpstreamUnavailable {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Upstream status code, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamUnavailable { status, .. } => *status,
            _ => None,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UpstreamUnavailable { .. } => "unavailable",
            Self::MalformedUpstreamResponse(_) => "malformed",
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}
