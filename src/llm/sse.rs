//! Line-buffered decoder for streamed provider responses.
//!
//! Providers deliver either Server-Sent Events (`data: <json>\n\n`, with a
//! `data: [DONE]` sentinel and `:` keep-alive comments) or raw
//! newline-delimited JSON. Network reads split those lines at arbitrary byte
//! offsets, so the decoder keeps the unfinished tail of the previous read and
//! only ever parses complete lines.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{GenerationError, Result};

/// Wire framing of a streamed response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `data: <json>` lines separated by blank lines.
    Sse,
    /// One JSON document per line.
    NdJson,
}

/// One decoded unit of a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A parsed JSON payload.
    Payload(serde_json::Value),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental decoder state for one response body.
#[derive(Debug)]
pub struct SseDecoder {
    framing: Framing,
    buffer: Vec<u8>,
}

impl SseDecoder {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    /// Feed newly read bytes and return every frame completed by them.
    ///
    /// A trailing partial line stays buffered until the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = self.decode_line(&line)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flush the buffered remainder once the body has ended.
    pub fn finish(&mut self) -> Result<Vec<Frame>> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let line = std::mem::take(&mut self.buffer);
        Ok(self.decode_line(&line)?.into_iter().collect())
    }

    fn decode_line(&self, raw: &[u8]) -> Result<Option<Frame>> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();

        // Blank separators and `: ping` keep-alives.
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        let payload = match self.framing {
            Framing::Sse => match line.strip_prefix("data:") {
                Some(rest) => rest.trim(),
                // event:, id:, retry: fields carry nothing we need
                None => return Ok(None),
            },
            Framing::NdJson => line,
        };

        if payload == "[DONE]" {
            return Ok(Some(Frame::Done));
        }

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) => {
                check_protocol_error(&value)?;
                Ok(Some(Frame::Payload(value)))
            }
            Err(e) => {
                tracing::debug!(error = %e, payload_len = payload.len(), "Skipping malformed stream payload");
                Ok(None)
            }
        }
    }
}

/// Raise on payloads that carry an explicit provider error.
fn check_protocol_error(value: &serde_json::Value) -> Result<()> {
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| err.as_str())
            .unwrap_or("Provider reported an error mid-stream");
        return Err(GenerationError::mid_stream(message));
    }

    let finish_reason = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|f| f.as_str());
    if finish_reason == Some("error") {
        return Err(GenerationError::mid_stream(
            "Provider ended the stream with an error",
        ));
    }

    Ok(())
}

/// Decode a response byte stream into frames.
///
/// The stream ends after the `[DONE]` sentinel, at end of input, after the
/// first error, or silently when `cancel` fires.
pub fn decode_frames<S, B, E>(
    bytes: S,
    framing: Framing,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Frame>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<GenerationError> + Send,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new(framing);
        futures::pin_mut!(bytes);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                next = bytes.next() => next,
            };

            let Some(chunk) = next else { break };
            let frames = match chunk {
                Ok(chunk) => decoder.push(chunk.as_ref()),
                Err(e) => Err(e.into()),
            };

            match frames {
                Ok(frames) => {
                    for frame in frames {
                        let done = frame == Frame::Done;
                        yield Ok(frame);
                        if done {
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        match decoder.finish() {
            Ok(frames) => {
                for frame in frames {
                    yield Ok(frame);
                }
            }
            Err(e) => yield Err(e),
        }
    }
}
