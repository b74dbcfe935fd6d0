//! Typed errors for the fragment pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.
//!
//! Transient collaborator failures ([`ApiError`] with a transient kind) never
//! leave the retry framework: they either resolve or become a
//! [`TerminalApiError`]. Phases turn terminal errors into fallback results, so
//! the only errors a caller ever sees come from input validation, payload
//! validation or persistence.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::payload::PayloadValidationError;
use crate::retry::Service;

/// Maximum length of an error message once it reaches a log field or job record.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Classification of a failed collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// The call did not answer in time
    Timeout,
    /// The provider throttled the call (HTTP 429 or equivalent)
    RateLimited,
    /// The connection could not be established or was dropped
    Connection,
    /// The request was rejected as invalid (business or schema error)
    Validation,
    /// Anything else (misconfiguration, unexpected status)
    Other,
}

impl ApiErrorKind {
    /// Timeouts, rate limits and connection failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiErrorKind::Timeout | ApiErrorKind::RateLimited | ApiErrorKind::Connection
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::Timeout => "timeout",
            ApiErrorKind::RateLimited => "rate_limited",
            ApiErrorKind::Connection => "connection",
            ApiErrorKind::Validation => "validation",
            ApiErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to an external collaborator (LLM API, database RPC, translator).
///
/// When the kind is transient this is the RetryableAPIError of the error
/// taxonomy; the retry framework decides what happens next.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimited, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Connection, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Validation, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Raised by the retry framework once a call can no longer succeed,
/// either because retries ran out or because the error is not retryable.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{service} call failed in {phase} after {attempts} attempt(s): {last_cause}")]
pub struct TerminalApiError {
    pub service: Service,
    pub phase: String,
    pub attempts: u32,
    pub last_cause: ApiError,
}

/// Malformed input submitted to the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },
}

/// Internal failure of the pipeline's own logic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{phase} failed: {message}")]
    Phase { phase: String, message: String },

    #[error("fragment task aborted: {0}")]
    TaskAborted(String),
}

/// A global reference string that does not follow `fragment_id#kind#id`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed global reference '{input}': {reason}")]
pub struct ReferenceFormatError {
    pub input: String,
    pub reason: String,
}

/// Umbrella error for the public API.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    TerminalApi(#[from] TerminalApiError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Payload(#[from] PayloadValidationError),

    #[error(transparent)]
    ReferenceFormat(#[from] ReferenceFormatError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Name of the error in the taxonomy, as stored in failed job records.
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::Validation(_)
            | PipelineError::ReferenceFormat(_)
            | PipelineError::Config(_) => "ValidationError",
            PipelineError::TerminalApi(_) => "TerminalAPIError",
            PipelineError::Processing(_) | PipelineError::Json(_) => "ProcessingError",
            PipelineError::Payload(e) => e.error_type(),
        }
    }

    /// Phase the error was raised in, when the error carries one.
    pub fn phase(&self) -> Option<&str> {
        match self {
            PipelineError::TerminalApi(e) => Some(&e.phase),
            PipelineError::Processing(ProcessingError::Phase { phase, .. }) => Some(phase),
            PipelineError::Payload(_) => Some("payload"),
            _ => None,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Strip control characters, collapse whitespace and cap the length of an
/// error message before it is logged or stored.
pub fn truncate_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    truncated.push('…');
    truncated
}
