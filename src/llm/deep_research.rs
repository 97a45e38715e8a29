//! Provider task shapes for deep-research models.
//!
//! - `OpenAI`: background responses (`POST /v1/responses` with
//!   `background: true`, then `GET /v1/responses/{id}`).
//! - Gemini: the Interactions API (`POST /v1beta/interactions`, then
//!   `GET /v1beta/interactions/{id}`).

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::GenerationRequest;
use super::background::{BackgroundTaskApi, TaskSnapshot, TaskStatus};
use super::client::ProviderClient;
use super::responses::ResponseObject;
use crate::error::Result;
use crate::normalized::{SourceCitation, UsageReport};

/// Deep research through `OpenAI` background responses.
#[derive(Debug, Clone)]
pub struct OpenAiResearchTask {
    client: ProviderClient,
}

impl OpenAiResearchTask {
    #[must_use]
    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn build_body(req: &GenerationRequest) -> serde_json::Value {
        let mut body = json!({
            "model": req.model_id,
            "input": req.prompt,
            "background": true,
            "store": true,
            // Deep-research models require at least one data source.
            "tools": [{ "type": "web_search_preview" }],
        });
        if let Some(system) = &req.system_instruction {
            body["instructions"] = json!(system);
        }
        if let Some(max) = req.sampling.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        body
    }
}

fn response_snapshot(response: ResponseObject) -> TaskSnapshot {
    let status = response.status.clone().unwrap_or_else(|| "queued".to_string());
    match TaskStatus::parse(&status) {
        TaskStatus::Pending => TaskSnapshot::Pending { status },
        TaskStatus::Succeeded => TaskSnapshot::Succeeded {
            text: response.text().unwrap_or_default(),
            sources: response.citations(),
            usage: response.usage_report(),
        },
        TaskStatus::Failed => TaskSnapshot::Failed {
            reason: response.failure_reason(),
        },
        TaskStatus::Cancelled => TaskSnapshot::Cancelled,
    }
}

#[async_trait::async_trait]
impl BackgroundTaskApi for OpenAiResearchTask {
    async fn create(&self, request: &GenerationRequest) -> Result<String> {
        let body = Self::build_body(request);
        let created: ResponseObject = self
            .client
            .send_json(self.client.post("/v1/responses", &body)?, &request.cancel)
            .await?;
        Ok(created.id)
    }

    async fn poll(&self, task_id: &str, cancel: &CancellationToken) -> Result<TaskSnapshot> {
        let path = format!("/v1/responses/{task_id}");
        let response: ResponseObject = self.client.send_json(self.client.get(&path)?, cancel).await?;
        Ok(response_snapshot(response))
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let path = format!("/v1/responses/{task_id}/cancel");
        self.client
            .send(self.client.post(&path, &json!({}))?, &CancellationToken::new())
            .await?;
        Ok(())
    }

    fn phase_label(&self) -> &str {
        "Deep research in progress"
    }
}

/// Deep research through the Gemini Interactions API.
#[derive(Debug, Clone)]
pub struct GeminiResearchTask {
    client: ProviderClient,
}

impl GeminiResearchTask {
    #[must_use]
    pub fn new(client: ProviderClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn build_body(req: &GenerationRequest) -> serde_json::Value {
        let mut body = json!({
            "agent": req.model_id,
            "input": req.prompt,
            "background": true,
        });
        if let Some(system) = &req.system_instruction {
            body["system_instruction"] = json!(system);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct Interaction {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    outputs: Vec<InteractionOutput>,
    #[serde(default)]
    usage: Option<InteractionUsage>,
    #[serde(default)]
    error: Option<InteractionError>,
}

#[derive(Debug, Deserialize)]
struct InteractionOutput {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    annotations: Vec<InteractionAnnotation>,
}

#[derive(Debug, Deserialize)]
struct InteractionAnnotation {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct InteractionUsage {
    #[serde(default)]
    total_input_tokens: u64,
    #[serde(default)]
    total_output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct InteractionError {
    #[serde(default)]
    message: Option<String>,
}

impl Interaction {
    fn into_snapshot(self) -> TaskSnapshot {
        let status = self.status.unwrap_or_else(|| "unspecified".to_string());
        match TaskStatus::parse(&status) {
            TaskStatus::Pending => TaskSnapshot::Pending { status },
            TaskStatus::Succeeded => {
                let text_outputs: Vec<&InteractionOutput> =
                    self.outputs.iter().filter(|o| o.kind == "text").collect();
                let text = text_outputs
                    .iter()
                    .filter_map(|o| o.text.as_deref())
                    .collect::<String>();
                let sources = text_outputs
                    .iter()
                    .flat_map(|o| &o.annotations)
                    .filter_map(|a| {
                        let uri = a.url.clone().or_else(|| a.source.clone())?;
                        let title = a.title.clone().unwrap_or_else(|| uri.clone());
                        Some(SourceCitation::new(uri, title))
                    })
                    .collect();
                TaskSnapshot::Succeeded {
                    text,
                    sources,
                    usage: self.usage.map(|u| UsageReport {
                        input_tokens: u.total_input_tokens,
                        output_tokens: u.total_output_tokens,
                    }),
                }
            }
            TaskStatus::Failed => TaskSnapshot::Failed {
                reason: self
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "The research task failed without details".to_string()),
            },
            TaskStatus::Cancelled => TaskSnapshot::Cancelled,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTaskApi for GeminiResearchTask {
    async fn create(&self, request: &GenerationRequest) -> Result<String> {
        let body = Self::build_body(request);
        let created: Interaction = self
            .client
            .send_json(self.client.post("/v1beta/interactions", &body)?, &request.cancel)
            .await?;
        Ok(created.id)
    }

    async fn poll(&self, task_id: &str, cancel: &CancellationToken) -> Result<TaskSnapshot> {
        let path = format!("/v1beta/interactions/{task_id}");
        let interaction: Interaction = self.client.send_json(self.client.get(&path)?, cancel).await?;
        Ok(interaction.into_snapshot())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        let path = format!("/v1beta/interactions/{task_id}:cancel");
        self.client
            .send(self.client.post(&path, &json!({}))?, &CancellationToken::new())
            .await?;
        Ok(())
    }

    fn phase_label(&self) -> &str {
        "Deep research in progress"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }
}
