//! Errors raised by provider adapters and the gateway.
//!
//! The sampler only needs one bit from these: may the trial be retried. Status
//! classification lives here so every adapter agrees on it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What the provider told us about a failed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    /// Provider error code from the body, e.g. "model_not_found".
    pub provider_code: Option<String>,
    /// `x-request-id` (or `request-id`) header.
    pub request_id: Option<String>,
}

impl ResponseMeta {
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl fmt::Display for ResponseMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(status) = self.status {
            parts.push(format!("status={status}"));
        }
        if let Some(code) = &self.provider_code {
            parts.push(format!("code={code}"));
        }
        if let Some(id) = &self.request_id {
            parts.push(format!("request_id={id}"));
        }
        f.write_str(&parts.join(" "))
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. Retried after `retry_after`, capped by the gateway's backoff.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        meta: ResponseMeta,
    },

    /// The request itself is wrong (bad model id, oversized input). Never retried.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String, meta: ResponseMeta },

    /// The model declined to answer. Never retried; the judge drops the trial.
    #[error("refused: {message}")]
    Refused { message: String },

    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        meta: ResponseMeta,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing API key, unrouted provider, unusable client settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    ///
    /// 429 is a rate limit; 400 and 404 are permanent; 408 and 5xx are
    /// transient; any other status is a permanent provider error.
    pub fn from_status(
        provider: &'static str,
        message: impl Into<String>,
        retry_after: Duration,
        meta: ResponseMeta,
    ) -> Self {
        let message = message.into();
        match meta.status.unwrap_or(0) {
            429 => Self::RateLimited { retry_after, meta },
            400 | 404 => Self::InvalidRequest { message, meta },
            status => Self::Provider {
                provider,
                message,
                retryable: status == 408 || status >= 500,
                meta,
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            meta: ResponseMeta::default(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            meta: ResponseMeta::default(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Short code recorded on failed usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn meta(&self) -> Option<&ResponseMeta> {
        match self {
            Self::RateLimited { meta, .. }
            | Self::InvalidRequest { meta, .. }
            | Self::Provider { meta, .. } => Some(meta),
            Self::Refused { .. } | Self::Http(_) | Self::Config(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16) -> ProviderError {
        ProviderError::from_status("openrouter", "x", Duration::from_secs(3), ResponseMeta::status(status))
    }

    #[test]
    fn status_codes_map_to_retryability() {
        assert!(matches!(classify(429), ProviderError::RateLimited { .. }));
        assert!(classify(429).is_retryable());
        assert!(matches!(classify(400), ProviderError::InvalidRequest { .. }));
        assert!(!classify(404).is_retryable());
        assert!(classify(408).is_retryable());
        assert!(classify(503).is_retryable());
        assert!(!classify(401).is_retryable());
        assert_eq!(classify(401).code(), "provider_error");
    }

    #[test]
    fn meta_renders_present_fields_only() {
        let meta = ResponseMeta {
            status: Some(502),
            provider_code: None,
            request_id: Some("req-1".to_string()),
        };
        assert_eq!(meta.to_string(), "status=502 request_id=req-1");
        assert_eq!(classify(502).meta().and_then(|m| m.status), Some(502));
    }
}
