//! Error types for autoswap-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using autoswap-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-stable error classification, used in response envelopes and the
/// performance ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AuthenticationFailed,
    RateLimited,
    CostLimitExceeded,
    TierForbidden,
    ProviderUnavailable,
    ModelNotFound,
    TaskNotSupported,
    DeadlineExceeded,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::AuthenticationFailed => "authentication_failed",
            Self::RateLimited => "rate_limited",
            Self::CostLimitExceeded => "cost_limit_exceeded",
            Self::TierForbidden => "tier_forbidden",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ModelNotFound => "model_not_found",
            Self::TaskNotSupported => "task_not_supported",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// One failed attempt inside a composite routing failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub model_id: String,
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// What the router should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDisposition {
    /// Surface the error to the caller immediately.
    Surface,
    /// Try the next candidate in the chain.
    NextCandidate,
    /// If the request pinned a provider/model, re-route once without the pin.
    UnpinAndRetry,
}

/// Errors that can occur while routing, gating, or executing a request.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input from the caller
    #[error("validation error: {0}")]
    Validation(String),

    /// Provider rejected our credentials
    #[error("authentication failed for {provider}: {message}")]
    AuthenticationFailed { provider: String, message: String },

    /// Provider signalled a 429-equivalent
    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    /// The cost gate refused the request
    #[error("cost limit exceeded: {0}")]
    CostLimitExceeded(String),

    /// Caller's tier cannot access the requested model
    #[error("tier forbidden: {0}")]
    TierForbidden(String),

    /// Provider absent, degraded, or unreachable
    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// Unknown model id
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Model does not support the requested task kind
    #[error("model {model_id} does not support task {task}")]
    TaskNotSupported { model_id: String, task: String },

    /// Deadline elapsed while waiting on a provider
    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// Every candidate in the fallback chain failed
    #[error("all {} candidates failed; last: {last_message}", .attempts.len())]
    AllCandidatesFailed {
        attempts: Vec<AttemptFailure>,
        last_message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ledger or cache storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a provider-unavailable error.
    pub fn provider_unavailable(
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a rate-limit error.
    pub fn rate_limited(provider: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after_ms,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CostLimitExceeded(_) => ErrorKind::CostLimitExceeded,
            Self::TierForbidden(_) => ErrorKind::TierForbidden,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::ModelNotFound(_) => ErrorKind::ModelNotFound,
            Self::TaskNotSupported { .. } => ErrorKind::TaskNotSupported,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::AllCandidatesFailed { attempts, .. } => attempts
                .last()
                .map(|a| a.kind)
                .unwrap_or(ErrorKind::Internal),
            Self::Serialization(_) | Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// How the router reacts when a fallback attempt ends with this error.
    ///
    /// Refusals from the gate and bad input are never recovered. Credential,
    /// availability, and capability failures only warrant a second routing
    /// pass when the caller pinned a provider or model. Rate limits,
    /// deadlines, and opaque provider failures move on to the next candidate.
    pub fn fallback_disposition(&self) -> FallbackDisposition {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::CostLimitExceeded | ErrorKind::TierForbidden => {
                FallbackDisposition::Surface
            }
            ErrorKind::AuthenticationFailed
            | ErrorKind::ProviderUnavailable
            | ErrorKind::ModelNotFound
            | ErrorKind::TaskNotSupported => FallbackDisposition::UnpinAndRetry,
            ErrorKind::RateLimited | ErrorKind::DeadlineExceeded | ErrorKind::Internal => {
                FallbackDisposition::NextCandidate
            }
        }
    }

    /// Short message safe to surface to callers. Vendor payloads are
    /// truncated so upstream error bodies never leak verbatim.
    pub fn redacted_message(&self) -> String {
        let full = self.to_string();
        const MAX: usize = 200;
        if full.len() <= MAX {
            full
        } else {
            let mut cut = MAX;
            while !full.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}…", &full[..cut])
        }
    }
}

/// Structured error envelope returned at the facade boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    pub request_id: String,
}

impl ErrorEnvelope {
    pub fn from_error(error: &Error, request_id: impl Into<String>) -> Self {
        Self {
            kind: error.kind(),
            message: error.redacted_message(),
            request_id: request_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::rate_limited("openai", None).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            Error::DeadlineExceeded { elapsed_ms: 60_000 }.kind(),
            ErrorKind::DeadlineExceeded
        );
        assert_eq!(Error::Storage("disk".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_composite_kind_follows_last_attempt() {
        let err = Error::AllCandidatesFailed {
            attempts: vec![
                AttemptFailure {
                    model_id: "a".into(),
                    provider: "openai".into(),
                    kind: ErrorKind::RateLimited,
                    message: "429".into(),
                },
                AttemptFailure {
                    model_id: "b".into(),
                    provider: "anthropic".into(),
                    kind: ErrorKind::DeadlineExceeded,
                    message: "timeout".into(),
                },
            ],
            last_message: "timeout".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_fallback_disposition() {
        assert_eq!(
            Error::CostLimitExceeded("cap".into()).fallback_disposition(),
            FallbackDisposition::Surface
        );
        assert_eq!(
            Error::ModelNotFound("gpt-9".into()).fallback_disposition(),
            FallbackDisposition::UnpinAndRetry
        );
        assert_eq!(
            Error::rate_limited("qwen", Some(500)).fallback_disposition(),
            FallbackDisposition::NextCandidate
        );
    }

    #[test]
    fn test_redacted_message_truncates() {
        let long = "x".repeat(500);
        let err = Error::Internal(long);
        assert!(err.redacted_message().len() < 220);
    }

    #[test]
    fn test_envelope_serde_round_trip() {
        let envelope = ErrorEnvelope {
            kind: ErrorKind::TierForbidden,
            message: "tier forbidden: free cannot use gpt-4o".into(),
            request_id: "req-1".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("tier_forbidden"));
        let back: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::TierForbidden);
    }
}
