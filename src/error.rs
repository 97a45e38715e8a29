//! Error taxonomy for the generation layer.
//!
//! Every failure that crosses a component boundary is a [`GenerationError`]:
//! a coarse [`ErrorKind`] that drives retry decisions plus a short message
//! suitable for showing to a user. Retry eligibility is decided from the kind
//! alone, never from the message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a generation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed credential / settings.
    Configuration,
    /// The backend rejected the credential (401/403).
    Authorization,
    /// The backend is throttling requests (429).
    RateLimited,
    /// Network failure, 5xx response or dropped connection.
    TransientTransport,
    /// Malformed parameters, context too long, unknown model (other 4xx).
    InvalidRequest,
    /// The backend accepted the request but failed after streaming began.
    MidStreamFailure,
    /// A background task reached a terminal failure state.
    TaskFailed,
    /// A background task outlived its wall-clock ceiling.
    Timeout,
    /// The caller's cancellation token fired.
    Aborted,
}

impl ErrorKind {
    /// Whether the retry controller may try the operation again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientTransport)
    }

    /// Classify an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authorization,
            429 => Self::RateLimited,
            500..=599 => Self::TransientTransport,
            _ => Self::InvalidRequest,
        }
    }

    /// Stable snake_case name, used as the SSE error code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Authorization => "authorization",
            Self::RateLimited => "rate_limited",
            Self::TransientTransport => "transient_transport",
            Self::InvalidRequest => "invalid_request",
            Self::MidStreamFailure => "mid_stream_failure",
            Self::TaskFailed => "task_failed",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, user-presentable generation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    kind: ErrorKind,
    message: String,
}

impl GenerationError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientTransport, message)
    }

    #[must_use]
    pub fn mid_stream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MidStreamFailure, message)
    }

    #[must_use]
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskFailed, message)
    }

    #[must_use]
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "Generation cancelled")
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::new(
                ErrorKind::from_status(status.as_u16()),
                format!("Provider returned HTTP {status}"),
            );
        }
        if err.is_decode() {
            return Self::mid_stream(format!("Could not decode provider response: {err}"));
        }
        // connect, timeout, body and request errors are all transport-level
        Self::transport(format!("Network error: {err}"))
    }
}

/// Result alias for the generation layer.
pub type Result<T> = std::result::Result<T, GenerationError>;
