//! Multi-provider generation layer.
//!
//! This module reduces every supported backend to one contract: given a
//! [`GenerationRequest`], produce an [`EventStream`] of text chunks followed
//! by a terminal `Done` (final text plus sources) or `Error`.
//!
//! # Overview
//!
//! - [`ProviderAdapter`]: one implementation per backend protocol family
//! - [`sse`]: line-buffered decoding of streamed response bodies
//! - [`retry`]: exponential backoff around connection establishment
//! - [`background`]: create-then-poll driver for server-side research tasks
//! - [`tokens`]: token estimation, exact counting and usage accounting
//! - [`coordinator`]: the per-session state machine that commits results
//!
//! # Adapters
//!
//! - [`ChatCompletionsAdapter`]: OpenAI-compatible `/v1/chat/completions` (`OpenRouter`, Groq)
//! - [`ResponsesAdapter`]: `OpenAI` Responses API (`/v1/responses`)
//! - [`GeminiAdapter`]: Gemini `streamGenerateContent`

pub mod background;
pub mod catalog;
pub mod chat_completions;
pub mod citations;
pub mod client;
pub mod coordinator;
pub mod deep_research;
pub mod gemini;
pub mod provider;
pub mod registry;
pub mod responses;
pub mod retry;
pub mod sse;
pub mod tokens;

use std::sync::Arc;

pub use chat_completions::ChatCompletionsAdapter;
pub use coordinator::{GenerationCoordinator, GenerationOutcome, GenerationState};
pub use gemini::GeminiAdapter;
pub use provider::{ModelInfo, ProviderDescriptor, ProviderKind};
pub use registry::ProviderRegistry;
pub use responses::ResponsesAdapter;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{GenerationError, Result};
use crate::normalized::{EventStream, SourceCitation, StreamEvent, UsageReport};
use background::BackgroundTaskApi;
use citations::CitationSet;
use sse::{Frame, Framing};

/// Sampling parameters supplied by the settings collaborator.
///
/// Adapters forward only the subset their provider's capabilities allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub seed: Option<i64>,
    pub stop_sequences: Vec<String>,
    pub max_output_tokens: Option<u32>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: None,
            seed: None,
            stop_sequences: Vec::new(),
            max_output_tokens: None,
        }
    }
}

/// Content-safety threshold, honored by providers with `safety_presets`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyPreset {
    /// Leave the provider's defaults untouched.
    #[default]
    ProviderDefault,
    BlockNone,
    BlockFew,
    BlockSome,
    BlockMost,
}

/// One generation call. Built fresh per call and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_instruction: Option<String>,
    pub prompt: String,
    pub model_id: String,
    pub sampling: SamplingSettings,
    pub grounding_enabled: bool,
    /// Reasoning token budget for models that expose one.
    pub thinking_budget: Option<u32>,
    pub safety: SafetyPreset,
    /// Threaded through every suspension point of the generation.
    pub cancel: CancellationToken,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            system_instruction: None,
            prompt: prompt.into(),
            model_id: model_id.into(),
            sampling: SamplingSettings::default(),
            grounding_enabled: false,
            thinking_budget: None,
            safety: SafetyPreset::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        self.system_instruction = (!instruction.trim().is_empty()).then_some(instruction);
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, sampling: SamplingSettings) -> Self {
        self.sampling = sampling;
        self
    }

    #[must_use]
    pub fn with_grounding(mut self, enabled: bool) -> Self {
        self.grounding_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_thinking_budget(mut self, budget: Option<u32>) -> Self {
        self.thinking_budget = budget;
        self
    }

    #[must_use]
    pub fn with_safety(mut self, safety: SafetyPreset) -> Self {
        self.safety = safety;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Trait implemented by every backend protocol family.
///
/// `connect` covers only connection establishment (request shaping, send,
/// status check). Once it returns, the stream it hands back is never
/// retried, since chunks from it may already have reached the caller.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static identity and capabilities.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Open a streaming generation.
    async fn connect(&self, request: &GenerationRequest) -> Result<EventStream>;

    /// Count input tokens through the provider's counting endpoint.
    async fn count_tokens(&self, _text: &str, _model_id: &str) -> Result<u64> {
        Err(GenerationError::configuration(format!(
            "{} has no token counting endpoint",
            self.descriptor().display_name
        )))
    }

    /// List available models. Defaults to the descriptor's static list.
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.descriptor().models.clone())
    }

    /// Background-task API for deep-research models, if the provider has one.
    fn background_api(&self) -> Option<Arc<dyn BackgroundTaskApi>> {
        None
    }
}

/// One unit of meaning extracted from a provider payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Delta {
    Text(String),
    Source(SourceCitation),
    Usage(UsageReport),
    /// The provider signalled completion inside the payload.
    Finished,
}

/// Drive a streamed response body into normalized events.
///
/// `parse` turns one decoded payload into deltas using the provider's own
/// schema. Text deltas are yielded as `Chunk`s in arrival order; the
/// accumulated text becomes `Done.final_text`. When `cancel` fires the
/// stream ends without a terminal event.
pub(crate) fn text_event_stream<F>(
    response: reqwest::Response,
    framing: Framing,
    cancel: CancellationToken,
    mut parse: F,
) -> EventStream
where
    F: FnMut(serde_json::Value) -> Result<Vec<Delta>> + Send + 'static,
{
    let frames = sse::decode_frames(response.bytes_stream(), framing, cancel.clone());

    Box::pin(async_stream::stream! {
        futures::pin_mut!(frames);
        let mut text = String::new();
        let mut sources = CitationSet::default();
        let mut usage: Option<UsageReport> = None;

        'read: while let Some(frame) = frames.next().await {
            if cancel.is_cancelled() {
                return;
            }
            let deltas = match frame {
                Ok(Frame::Done) => break,
                Ok(Frame::Payload(value)) => parse(value),
                Err(e) => Err(e),
            };
            let deltas = match deltas {
                Ok(deltas) => deltas,
                Err(e) => {
                    tracing::warn!(error = %e, kind = %e.kind(), "Stream failed after it started");
                    yield StreamEvent::from_error(&e);
                    return;
                }
            };

            for delta in deltas {
                match delta {
                    Delta::Text(t) if t.is_empty() => {}
                    Delta::Text(t) => {
                        text.push_str(&t);
                        yield StreamEvent::Chunk { text: t };
                    }
                    Delta::Source(s) => sources.add(s),
                    Delta::Usage(u) => usage = Some(u),
                    Delta::Finished => break 'read,
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        let sources = sources.or_markdown_fallback(&text);
        yield StreamEvent::Done { final_text: text, sources, usage };
    })
}
