//! `OpenAI` Responses API adapter.
//!
//! Streams `/v1/responses` as semantic events. Text arrives in
//! `response.output_text.delta`; `response.failed` and `error` events are
//! fatal even though the HTTP status was 2xx.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::background::BackgroundTaskApi;
use super::client::ProviderClient;
use super::deep_research::OpenAiResearchTask;
use super::provider::{ModelInfo, ProviderDescriptor};
use super::sse::Framing;
use super::{Delta, GenerationRequest, ProviderAdapter, text_event_stream};
use crate::error::{GenerationError, Result};
use crate::normalized::{EventStream, SourceCitation, UsageReport};

/// Adapter for the Responses protocol.
#[derive(Debug, Clone)]
pub struct ResponsesAdapter {
    client: ProviderClient,
    research: Arc<OpenAiResearchTask>,
}

impl ResponsesAdapter {
    #[must_use]
    pub fn new(client: ProviderClient) -> Self {
        let research = Arc::new(OpenAiResearchTask::new(client.clone()));
        Self { client, research }
    }

    #[must_use]
    pub fn build_body(&self, req: &GenerationRequest) -> serde_json::Value {
        let caps = self.client.descriptor().capabilities;
        let mut body = json!({
            "model": req.model_id,
            "stream": true,
            "input": req.prompt,
        });

        if let Some(system) = &req.system_instruction {
            body["instructions"] = json!(system);
        }

        // Reasoning models reject sampling parameters.
        if let Some(budget) = req.thinking_budget {
            body["reasoning"] = json!({ "effort": reasoning_effort(budget) });
        } else {
            body["temperature"] = json!(req.sampling.temperature);
            body["top_p"] = json!(req.sampling.top_p);
        }

        if caps.max_tokens
            && let Some(max) = req.sampling.max_output_tokens
        {
            body["max_output_tokens"] = json!(max);
        }
        if req.grounding_enabled && caps.grounding {
            body["tools"] = json!([{ "type": "web_search_preview" }]);
        }
        body
    }
}

/// Map a token budget onto the Responses API's coarse effort levels.
fn reasoning_effort(budget: u32) -> &'static str {
    match budget {
        0 => "minimal",
        1..=4096 => "low",
        4097..=16384 => "medium",
        _ => "high",
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ResponsesAdapter {
    fn descriptor(&self) -> &ProviderDescriptor {
        self.client.descriptor()
    }

    async fn connect(&self, req: &GenerationRequest) -> Result<EventStream> {
        let body = self.build_body(req);
        tracing::debug!(model = %req.model_id, grounded = req.grounding_enabled, "Opening responses stream");

        let request = self.client.post("/v1/responses", &body)?;
        let response = self.client.send(request, &req.cancel).await?;

        Ok(text_event_stream(
            response,
            Framing::Sse,
            req.cancel.clone(),
            parse_event,
        ))
    }

    async fn count_tokens(&self, text: &str, model_id: &str) -> Result<u64> {
        let body = json!({ "model": model_id, "input": text });
        let counted: InputTokens = self
            .client
            .send_json(
                self.client.post("/v1/responses/input_tokens", &body)?,
                &CancellationToken::new(),
            )
            .await?;
        Ok(counted.input_tokens)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let listing: ModelList = self
            .client
            .send_json(self.client.get("/v1/models")?, &CancellationToken::new())
            .await?;
        let descriptor = self.client.descriptor();
        Ok(listing
            .data
            .into_iter()
            .map(|m| descriptor.model_info(&m.id))
            .collect())
    }

    fn background_api(&self) -> Option<Arc<dyn BackgroundTaskApi>> {
        Some(Arc::clone(&self.research) as Arc<dyn BackgroundTaskApi>)
    }
}

#[derive(Debug, Deserialize)]
struct InputTokens {
    input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Streamed Responses API events we act on.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponsesEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.output_text.annotation.added")]
    AnnotationAdded { annotation: OutputAnnotation },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseObject },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponseObject },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseObject },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// A Responses API `response` object, streamed or polled.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ResponseObject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    /// SDK convenience field some proxies include.
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub usage: Option<ResponseUsage>,
    #[serde(default)]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Vec<OutputContent>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub annotations: Vec<OutputAnnotation>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OutputAnnotation {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct ResponseUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseError {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

impl OutputAnnotation {
    pub(crate) fn citation(&self) -> Option<SourceCitation> {
        if self.kind != "url_citation" {
            return None;
        }
        let url = self.url.clone()?;
        let title = self.title.clone().unwrap_or_else(|| url.clone());
        Some(SourceCitation::new(url, title))
    }
}

impl ResponseObject {
    /// Concatenated `output_text` parts of all message items.
    pub(crate) fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| &item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect();
        if parts.is_empty() {
            self.output_text.clone().filter(|t| !t.is_empty())
        } else {
            Some(parts.concat())
        }
    }

    pub(crate) fn citations(&self) -> Vec<SourceCitation> {
        self.output
            .iter()
            .flat_map(|item| &item.content)
            .flat_map(|c| &c.annotations)
            .filter_map(OutputAnnotation::citation)
            .collect()
    }

    pub(crate) fn failure_reason(&self) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.message.clone())
            .or_else(|| {
                self.incomplete_details
                    .as_ref()
                    .and_then(|d| d.reason.clone())
                    .map(|r| format!("Response incomplete: {r}"))
            })
            .unwrap_or_else(|| "The provider reported a failure without details".to_string())
    }

    pub(crate) fn usage_report(&self) -> Option<UsageReport> {
        self.usage.map(|u| UsageReport {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
    }
}

fn parse_event(value: serde_json::Value) -> Result<Vec<Delta>> {
    let event: ResponsesEvent = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring responses event with unexpected shape");
            return Ok(Vec::new());
        }
    };

    match event {
        ResponsesEvent::OutputTextDelta { delta } => Ok(vec![Delta::Text(delta)]),
        ResponsesEvent::AnnotationAdded { annotation } => {
            Ok(annotation.citation().map(Delta::Source).into_iter().collect())
        }
        ResponsesEvent::Completed { response } => {
            let mut deltas: Vec<Delta> = response.citations().into_iter().map(Delta::Source).collect();
            if let Some(usage) = response.usage_report() {
                deltas.push(Delta::Usage(usage));
            }
            deltas.push(Delta::Finished);
            Ok(deltas)
        }
        ResponsesEvent::Incomplete { response } => {
            tracing::warn!(reason = %response.failure_reason(), "Response ended incomplete");
            let mut deltas = Vec::new();
            if let Some(usage) = response.usage_report() {
                deltas.push(Delta::Usage(usage));
            }
            deltas.push(Delta::Finished);
            Ok(deltas)
        }
        ResponsesEvent::Failed { response } => {
            Err(GenerationError::mid_stream(response.failure_reason()))
        }
        ResponsesEvent::Error { message, code } => Err(GenerationError::mid_stream(
            message
                .or(code)
                .unwrap_or_else(|| "The provider reported a stream error".to_string()),
        )),
        ResponsesEvent::Other => Ok(Vec::new()),
    }
}
