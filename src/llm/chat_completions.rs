//! OpenAI-compatible Chat Completions adapter.
//!
//! Serves every backend that speaks `/v1/chat/completions` with SSE
//! streaming (`OpenRouter`, Groq). Text arrives in `choices[0].delta.content`;
//! the stream ends with `data: [DONE]`.

use serde::Deserialize;
use serde_json::json;

use super::client::ProviderClient;
use super::provider::{ModelInfo, ProviderDescriptor, ProviderKind};
use super::sse::Framing;
use super::{Delta, GenerationRequest, ProviderAdapter, text_event_stream};
use crate::error::{GenerationError, Result};
use crate::normalized::{EventStream, SourceCitation, UsageReport};

/// Adapter for the Chat Completions protocol.
#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    client: ProviderClient,
}

impl ChatCompletionsAdapter {
    #[must_use]
    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    /// Shape the request body, sending only parameters the backend supports.
    #[must_use]
    pub fn build_body(&self, req: &GenerationRequest) -> serde_json::Value {
        let descriptor = self.client.descriptor();
        let caps = descriptor.capabilities;
        let sampling = &req.sampling;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &req.system_instruction {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));

        let mut body = json!({
            "model": req.model_id,
            "stream": true,
            "stream_options": { "include_usage": true },
            "messages": messages,
            "temperature": sampling.temperature,
            "top_p": sampling.top_p,
        });

        if caps.top_k
            && let Some(top_k) = sampling.top_k
        {
            body["top_k"] = json!(top_k);
        }
        if caps.seed
            && let Some(seed) = sampling.seed
        {
            body["seed"] = json!(seed);
        }
        if caps.stop_sequences && !sampling.stop_sequences.is_empty() {
            body["stop"] = json!(sampling.stop_sequences);
        }
        if caps.max_tokens
            && let Some(max) = sampling.max_output_tokens
        {
            body["max_tokens"] = json!(max);
        }

        if descriptor.kind == ProviderKind::OpenRouter {
            if req.grounding_enabled && caps.grounding {
                body["plugins"] = json!([{ "id": "web" }]);
            }
            if let Some(budget) = req.thinking_budget {
                body["reasoning"] = json!({ "max_tokens": budget });
            }
        }

        body
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ChatCompletionsAdapter {
    fn descriptor(&self) -> &ProviderDescriptor {
        self.client.descriptor()
    }

    async fn connect(&self, req: &GenerationRequest) -> Result<EventStream> {
        let body = self.build_body(req);
        tracing::debug!(
            provider = %self.client.descriptor().kind,
            model = %req.model_id,
            grounded = req.grounding_enabled,
            "Opening chat completions stream"
        );

        let request = self.client.post("/v1/chat/completions", &body)?;
        let response = self.client.send(request, &req.cancel).await?;

        Ok(text_event_stream(
            response,
            Framing::Sse,
            req.cancel.clone(),
            parse_chunk,
        ))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let listing: ModelList = self
            .client
            .send_json(self.client.get("/v1/models")?, &tokio_util::sync::CancellationToken::new())
            .await?;
        let descriptor = self.client.descriptor();
        Ok(listing.data.iter().map(|m| descriptor.model_info(&m.id)).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// One streamed `chat.completion.chunk`.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    /// Perplexity-style flat citation list.
    #[serde(default)]
    citations: Vec<String>,
    /// Groq reports usage under its own extension key.
    #[serde(default)]
    x_groq: Option<GroqExtension>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(default)]
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct GroqExtension {
    #[serde(default)]
    usage: Option<ChatUsage>,
}

fn parse_chunk(value: serde_json::Value) -> Result<Vec<Delta>> {
    let chunk: ChatChunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring chat chunk with unexpected shape");
            return Ok(Vec::new());
        }
    };

    let mut deltas = Vec::new();

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.content {
            deltas.push(Delta::Text(text));
        }
        for annotation in choice.delta.annotations {
            if let Some(c) = annotation.url_citation {
                let title = c.title.unwrap_or_else(|| c.url.clone());
                deltas.push(Delta::Source(SourceCitation::new(c.url, title)));
            }
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GenerationError::mid_stream(
                "The provider's content filter stopped the response.",
            ));
        }
    }

    for url in chunk.citations {
        deltas.push(Delta::Source(SourceCitation::new(url.clone(), url)));
    }

    if let Some(usage) = chunk.usage.or_else(|| chunk.x_groq.and_then(|x| x.usage)) {
        deltas.push(Delta::Usage(UsageReport {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }

    Ok(deltas)
}
