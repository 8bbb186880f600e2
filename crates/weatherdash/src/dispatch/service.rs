//! Seam between the dispatcher and a streaming text-generation backend.
//!
//! The dispatcher only ever calls [`TextService::open`], which makes it
//! testable with scripted services.

use super::claude::{Message, ToolDefinition};
use super::EffortLevel;
use futures::Stream;
use std::pin::Pin;

/// Upstream statuses worth retrying. 529 is Anthropic's "overloaded".
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504, 529];

/// Lower-cased message fragments that mark a transient failure.
const RETRYABLE_MARKERS: &[&str] = &[
    "unavailable",
    "rate limit",
    "timed out",
    "timeout",
    "overloaded",
    "try again",
    "temporarily",
];

/// Text chunks in upstream arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ServiceError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Transport(String),

    #[error("ANTHROPIC_API_KEY not set")]
    MissingApiKey,

    #[error("format error: {0}")]
    Format(String),
}

impl ServiceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transient failures the dispatcher may retry or fall back from.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Api { status, .. } if RETRYABLE_STATUSES.contains(status) => true,
            ServiceError::Timeout(_) | ServiceError::Connect(_) => true,
            ServiceError::MissingApiKey => false,
            other => {
                let text = other.to_string().to_ascii_lowercase();
                RETRYABLE_MARKERS.iter().any(|m| text.contains(m))
            }
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout(e.to_string())
        } else if e.is_connect() {
            ServiceError::Connect(e.to_string())
        } else if e.is_decode() {
            ServiceError::Format(e.to_string())
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}

/// One attempt's request, as seen by the backend.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub model: String,
    pub effort: EffortLevel,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<Message>,
}

/// A streaming text-generation backend.
pub trait TextService: Send + Sync {
    /// Open a response stream. Errors here happen before any output.
    fn open(
        &self,
        call: &ServiceCall,
    ) -> impl std::future::Future<Output = Result<ChunkStream, ServiceError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> ServiceError {
        ServiceError::Api {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504, 529] {
            assert!(api(status, "").is_retryable(), "status {}", status);
        }
        for status in [400, 401, 403, 404, 413] {
            assert!(!api(status, "bad request").is_retryable(), "status {}", status);
        }
    }

    #[test]
    fn retryable_by_message() {
        assert!(api(400, "Model is temporarily Unavailable").is_retryable());
        assert!(api(418, "please try again later").is_retryable());
        assert!(ServiceError::Transport("upstream overloaded".into()).is_retryable());
        assert!(ServiceError::Format("read timed out".into()).is_retryable());
        assert!(!ServiceError::Format("expected value at line 1".into()).is_retryable());
    }

    #[test]
    fn transport_failures_are_retryable() {
        assert!(ServiceError::Timeout("deadline".into()).is_retryable());
        assert!(ServiceError::Connect("refused".into()).is_retryable());
        assert!(!ServiceError::MissingApiKey.is_retryable());
    }

    #[test]
    fn status_only_for_api_errors() {
        assert_eq!(api(429, "slow down").status(), Some(429));
        assert_eq!(ServiceError::Connect("x".into()).status(), None);
    }
}
