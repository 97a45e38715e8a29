//! Gemini `streamGenerateContent` adapter.
//!
//! Uses the SSE variant (`?alt=sse`). Each event carries a partial
//! `GenerateContentResponse`; text lives in `candidates[0].content.parts`,
//! search sources in `groundingMetadata.groundingChunks`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::background::BackgroundTaskApi;
use super::client::ProviderClient;
use super::deep_research::GeminiResearchTask;
use super::provider::{ModelInfo, ProviderDescriptor};
use super::sse::Framing;
use super::{Delta, GenerationRequest, ProviderAdapter, SafetyPreset, text_event_stream};
use crate::error::{ErrorKind, GenerationError, Result};
use crate::normalized::{EventStream, SourceCitation, UsageReport};

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Adapter for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: ProviderClient,
    research: Arc<GeminiResearchTask>,
}

impl GeminiAdapter {
    #[must_use]
    pub fn new(client: ProviderClient) -> Self {
        let research = Arc::new(GeminiResearchTask::new(client.clone()));
        Self { client, research }
    }

    #[must_use]
    pub fn build_body(&self, req: &GenerationRequest) -> serde_json::Value {
        let caps = self.client.descriptor().capabilities;
        let sampling = &req.sampling;

        let mut config = json!({
            "temperature": sampling.temperature,
            "topP": sampling.top_p,
        });
        if caps.top_k
            && let Some(top_k) = sampling.top_k
        {
            config["topK"] = json!(top_k);
        }
        if caps.seed
            && let Some(seed) = sampling.seed
        {
            config["seed"] = json!(seed);
        }
        if caps.stop_sequences && !sampling.stop_sequences.is_empty() {
            config["stopSequences"] = json!(sampling.stop_sequences);
        }
        if caps.max_tokens
            && let Some(max) = sampling.max_output_tokens
        {
            config["maxOutputTokens"] = json!(max);
        }
        if let Some(budget) = req.thinking_budget {
            config["thinkingConfig"] = json!({ "thinkingBudget": budget });
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": req.prompt }] }],
            "generationConfig": config,
        });

        if let Some(system) = &req.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if caps.safety_presets
            && let Some(threshold) = safety_threshold(req.safety)
        {
            body["safetySettings"] = HARM_CATEGORIES
                .iter()
                .map(|category| json!({ "category": category, "threshold": threshold }))
                .collect();
        }
        if req.grounding_enabled && caps.grounding {
            body["tools"] = json!([{ "google_search": {} }]);
        }
        body
    }
}

/// Model ids go into the URL path unencoded, so only plain id characters pass.
fn model_segment(model_id: &str) -> Result<&str> {
    let valid = !model_id.is_empty()
        && model_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if valid {
        Ok(model_id)
    } else {
        Err(GenerationError::new(
            ErrorKind::InvalidRequest,
            format!("Invalid Gemini model id: {model_id:?}"),
        ))
    }
}

fn safety_threshold(preset: SafetyPreset) -> Option<&'static str> {
    match preset {
        SafetyPreset::ProviderDefault => None,
        SafetyPreset::BlockNone => Some("BLOCK_NONE"),
        SafetyPreset::BlockFew => Some("BLOCK_ONLY_HIGH"),
        SafetyPreset::BlockSome => Some("BLOCK_MEDIUM_AND_ABOVE"),
        SafetyPreset::BlockMost => Some("BLOCK_LOW_AND_ABOVE"),
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn descriptor(&self) -> &ProviderDescriptor {
        self.client.descriptor()
    }

    async fn connect(&self, req: &GenerationRequest) -> Result<EventStream> {
        let body = self.build_body(req);
        let path = format!("/v1beta/models/{}:streamGenerateContent", model_segment(&req.model_id)?);
        tracing::debug!(model = %req.model_id, grounded = req.grounding_enabled, "Opening Gemini stream");

        let request = self.client.post(&path, &body)?.query(&[("alt", "sse")]);
        let response = self.client.send(request, &req.cancel).await?;

        Ok(text_event_stream(
            response,
            Framing::Sse,
            req.cancel.clone(),
            parse_chunk,
        ))
    }

    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u64> {
        let body = json!({ "contents": [{ "parts": [{ "text": text }] }] });
        let path = format!("/v1beta/models/{}:countTokens", model_segment(model_id)?);
        let counted: CountTokens = self
            .client
            .send_json(self.client.post(&path, &body)?, &CancellationToken::new())
            .await?;
        Ok(counted.total_tokens)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let listing: ModelList = self
            .client
            .send_json(self.client.get("/v1beta/models")?, &CancellationToken::new())
            .await?;
        let descriptor = self.client.descriptor();
        Ok(listing
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|g| g == "generateContent")
            })
            .map(|m| descriptor.model_info(m.name.trim_start_matches("models/")))
            .collect())
    }

    fn background_api(&self) -> Option<Arc<dyn BackgroundTaskApi>> {
        Some(Arc::clone(&self.research) as Arc<dyn BackgroundTaskApi>)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokens {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

/// One streamed `GenerateContentResponse`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    /// Thought summaries are not part of the artifact.
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn parse_chunk(value: serde_json::Value) -> Result<Vec<Delta>> {
    let chunk: GenerateContentChunk = match serde_json::from_value(value) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring Gemini chunk with unexpected shape");
            return Ok(Vec::new());
        }
    };

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GenerationError::mid_stream(format!(
            "Gemini blocked the prompt ({reason})."
        )));
    }

    let mut deltas = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            deltas.extend(
                content
                    .parts
                    .into_iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text)
                    .map(Delta::Text),
            );
        }
        if let Some(metadata) = candidate.grounding_metadata {
            deltas.extend(
                metadata
                    .grounding_chunks
                    .into_iter()
                    .filter_map(|c| c.web)
                    .map(|w| {
                        let title = w.title.unwrap_or_else(|| w.uri.clone());
                        Delta::Source(SourceCitation::new(w.uri, title))
                    }),
            );
        }
        if let Some(reason) = candidate.finish_reason.as_deref()
            && matches!(reason, "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII")
        {
            return Err(GenerationError::mid_stream(format!(
                "Gemini stopped the response ({reason})."
            )));
        }
    }

    if let Some(usage) = chunk.usage_metadata {
        deltas.push(Delta::Usage(UsageReport {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
        }));
    }

    Ok(deltas)
}
