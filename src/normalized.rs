//! Normalized event types for generation streams.
//!
//! Every provider protocol (chat-completions SSE, Responses-API SSE, Gemini
//! SSE, background-task polling) is reduced to the same [`StreamEvent`]
//! sequence: zero or more `Chunk`/`Status` events followed by exactly one
//! terminal `Done` or `Error`. A cancelled generation simply ends without a
//! terminal event; callers detect that through the cancellation token.
//!
//! # Example
//!
//! ```rust
//! use artifact_forge::normalized::{StreamEvent, sse_event};
//!
//! let event = StreamEvent::Chunk {
//!     text: "Hello".to_string(),
//! };
//! let sse = sse_event(&event);
//! assert!(sse.starts_with("event: chunk\n"));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GenerationError};

/// A web source the model used, deduplicated by `uri` within one generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCitation {
    /// Source URL.
    pub uri: String,
    /// Human-readable title (may be the URL when the provider gives none).
    pub title: String,
}

impl SourceCitation {
    #[must_use]
    pub fn new(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: title.into(),
        }
    }
}

/// Token counts reported by the provider at the end of a generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Normalized generation event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text, delivered in wire order.
    Chunk {
        /// The text fragment to append.
        text: String,
    },

    /// Progress information (retry waits, background task phases).
    Status {
        message: String,
    },

    /// Terminal failure.
    Error {
        #[serde(rename = "error_kind")]
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },

    /// Terminal success.
    Done {
        final_text: String,
        #[serde(default)]
        sources: Vec<SourceCitation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageReport>,
    },
}

impl StreamEvent {
    /// Build a terminal error event from a [`GenerationError`].
    #[must_use]
    pub fn from_error(err: &GenerationError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.message().to_string(),
            retryable: err.is_retryable(),
        }
    }

    #[must_use]
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    /// Returns true for `Done` and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Recover the typed error carried by an `Error` event.
    #[must_use]
    pub fn as_error(&self) -> Option<GenerationError> {
        match self {
            Self::Error { kind, message, .. } => Some(GenerationError::new(*kind, message.clone())),
            _ => None,
        }
    }
}

/// Boxed stream of normalized events, the uniform output of every adapter.
pub type EventStream = std::pin::Pin<Box<dyn futures::Stream<Item = StreamEvent> + Send>>;

/// Convert a [`StreamEvent`] to an SSE-formatted string.
///
/// The output has both an `event:` line (for `EventSource` listeners) and a
/// `data:` line containing the JSON payload.
pub fn sse_event(evt: &StreamEvent) -> String {
    let json = serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({
            "kind": "error",
            "error_kind": "mid_stream_failure",
            "message": e.to_string(),
            "retryable": false
        })
        .to_string()
    });

    format!("event: {}\ndata: {json}\n\n", event_name(evt))
}

/// Get the SSE event name for a [`StreamEvent`].
pub fn event_name(evt: &StreamEvent) -> &'static str {
    match evt {
        StreamEvent::Chunk { .. } => "chunk",
        StreamEvent::Status { .. } => "status",
        StreamEvent::Error { .. } => "error",
        StreamEvent::Done { .. } => "done",
    }
}
