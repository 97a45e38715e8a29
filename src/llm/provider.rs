//! Provider identities, capabilities and error tables.
//!
//! Each backend is a [`ProviderKind`] variant with one immutable
//! [`ProviderDescriptor`]. Request shaping consults the descriptor's
//! [`Capabilities`] so that parameters a backend rejects are never sent, and
//! error responses are mapped through the backend's own code table into a
//! short user-facing message.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, GenerationError};

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini (generativelanguage.googleapis.com)
    Gemini,
    /// `OpenAI` Responses API (api.openai.com)
    #[serde(rename = "openai")]
    OpenAi,
    /// `OpenRouter` (openrouter.ai), OpenAI-compatible chat completions
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// Groq (groq.com), OpenAI-compatible chat completions
    Groq,
}

impl ProviderKind {
    /// Every provider, in display order.
    pub const ALL: [ProviderKind; 4] = [Self::Gemini, Self::OpenAi, Self::OpenRouter, Self::Groq];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
        }
    }

    /// Environment variable holding this provider's API key.
    #[must_use]
    pub fn credential_env(self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::Groq => "GROQ_API_KEY",
        }
    }

    /// The static descriptor for this provider.
    #[must_use]
    pub fn descriptor(self) -> ProviderDescriptor {
        match self {
            Self::Gemini => ProviderDescriptor {
                kind: self,
                display_name: "Google Gemini",
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                auth: AuthStyle::GoogApiKey,
                capabilities: Capabilities {
                    max_tokens: true,
                    stop_sequences: true,
                    seed: true,
                    top_k: true,
                    safety_presets: true,
                    grounding: true,
                    background_tasks: true,
                    token_counting: true,
                },
                models: vec![
                    ModelInfo::new("gemini-2.5-pro", 1.25, 10.0),
                    ModelInfo::new("gemini-2.5-flash", 0.30, 2.50),
                    ModelInfo::new("gemini-2.5-flash-lite", 0.10, 0.40),
                    ModelInfo::new("deep-research-pro-preview-12-2025", 2.0, 12.0),
                ],
                grounding_fee: 0.035,
            },
            Self::OpenAi => ProviderDescriptor {
                kind: self,
                display_name: "OpenAI",
                base_url: "https://api.openai.com".to_string(),
                auth: AuthStyle::Bearer,
                capabilities: Capabilities {
                    max_tokens: true,
                    stop_sequences: false,
                    seed: false,
                    top_k: false,
                    safety_presets: false,
                    grounding: true,
                    background_tasks: true,
                    token_counting: true,
                },
                models: vec![
                    ModelInfo::new("gpt-5", 1.25, 10.0),
                    ModelInfo::new("gpt-5-mini", 0.25, 2.0),
                    ModelInfo::new("gpt-4.1", 2.0, 8.0),
                    ModelInfo::new("o3-deep-research", 10.0, 40.0),
                    ModelInfo::new("o4-mini-deep-research", 2.0, 8.0),
                ],
                grounding_fee: 0.01,
            },
            Self::OpenRouter => ProviderDescriptor {
                kind: self,
                display_name: "OpenRouter",
                base_url: "https://openrouter.ai/api".to_string(),
                auth: AuthStyle::Bearer,
                capabilities: Capabilities {
                    max_tokens: true,
                    stop_sequences: true,
                    seed: true,
                    top_k: true,
                    safety_presets: false,
                    grounding: true,
                    background_tasks: false,
                    token_counting: false,
                },
                models: vec![
                    ModelInfo::new("anthropic/claude-sonnet-4.5", 3.0, 15.0),
                    ModelInfo::new("google/gemini-2.5-pro", 1.25, 10.0),
                    ModelInfo::new("deepseek/deepseek-chat-v3.1", 0.27, 1.10),
                ],
                grounding_fee: 0.02,
            },
            Self::Groq => ProviderDescriptor {
                kind: self,
                display_name: "Groq",
                base_url: "https://api.groq.com/openai".to_string(),
                auth: AuthStyle::Bearer,
                capabilities: Capabilities {
                    max_tokens: true,
                    stop_sequences: true,
                    seed: true,
                    top_k: false,
                    safety_presets: false,
                    grounding: false,
                    background_tasks: false,
                    token_counting: false,
                },
                models: vec![
                    ModelInfo::new("llama-3.3-70b-versatile", 0.59, 0.79),
                    ModelInfo::new("openai/gpt-oss-120b", 0.15, 0.75),
                    ModelInfo::new("moonshotai/kimi-k2-instruct", 1.0, 3.0),
                ],
                grounding_fee: 0.0,
            },
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GenerationError::configuration(format!("Unknown provider '{s}'")))
    }
}

/// How a provider expects its credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-goog-api-key: <key>`
    GoogApiKey,
}

/// Request parameters and features a backend accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub max_tokens: bool,
    pub stop_sequences: bool,
    pub seed: bool,
    pub top_k: bool,
    pub safety_presets: bool,
    pub grounding: bool,
    pub background_tasks: bool,
    pub token_counting: bool,
}

/// A model offered by a provider, with per-million-token pricing in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelInfo {
    #[must_use]
    pub fn new(id: impl Into<String>, input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            id: id.into(),
            input_per_million,
            output_per_million,
        }
    }

    /// Pricing-free entry for models discovered at runtime.
    #[must_use]
    pub fn unpriced(id: impl Into<String>) -> Self {
        Self::new(id, 0.0, 0.0)
    }
}

/// Static identity of a backend.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub display_name: &'static str,
    /// Base endpoint without trailing slash.
    pub base_url: String,
    pub auth: AuthStyle,
    pub capabilities: Capabilities,
    /// Default model list, used until (or instead of) a live listing.
    pub models: Vec<ModelInfo>,
    /// Cost in USD of one grounded (web search) request.
    pub grounding_fee: f64,
}

impl ProviderDescriptor {
    /// Replace the base endpoint (config overrides, tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Join a path onto the base endpoint.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Build authentication and attribution headers.
    pub fn headers(&self, credential: &str) -> Result<HeaderMap, GenerationError> {
        let mut headers = HeaderMap::new();
        match self.auth {
            AuthStyle::Bearer => {
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    header_value(&format!("Bearer {credential}"))?,
                );
            }
            AuthStyle::GoogApiKey => {
                headers.insert(
                    HeaderName::from_static("x-goog-api-key"),
                    header_value(credential)?,
                );
            }
        }
        if self.kind == ProviderKind::OpenRouter {
            headers.insert(
                HeaderName::from_static("x-title"),
                HeaderValue::from_static("artifact-forge"),
            );
        }
        Ok(headers)
    }

    /// Pricing for a model, falling back to an unpriced entry.
    #[must_use]
    pub fn model_info(&self, model_id: &str) -> ModelInfo {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
            .unwrap_or_else(|| ModelInfo::unpriced(model_id))
    }

    /// Whether a model runs as a server-side background task.
    #[must_use]
    pub fn is_background_model(&self, model_id: &str) -> bool {
        self.capabilities.background_tasks && model_id.contains("deep-research")
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, GenerationError> {
    HeaderValue::from_str(raw)
        .map_err(|e| GenerationError::configuration(format!("Credential is not a valid header value: {e}")))
}

/// Error body shape shared by OpenAI-compatible backends and Gemini.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    /// OpenAI: string code; Gemini: numeric HTTP code.
    #[serde(default)]
    code: Option<serde_json::Value>,
    /// OpenAI error type.
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    /// Gemini canonical status such as `RESOURCE_EXHAUSTED`.
    #[serde(default)]
    status: Option<String>,
}

/// Map a non-2xx response into a typed, user-presentable error.
#[must_use]
pub fn map_status_error(provider: ProviderKind, status: u16, body: &str) -> GenerationError {
    let kind = ErrorKind::from_status(status);
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);

    let code = parsed.as_ref().and_then(|e| {
        e.code
            .as_ref()
            .and_then(|c| c.as_str().map(ToString::to_string))
            .or_else(|| e.status.clone())
            .or_else(|| e.error_type.clone())
    });

    let message = code
        .as_deref()
        .and_then(|c| code_message(provider, c))
        .map(ToString::to_string)
        .or_else(|| parsed.and_then(|e| e.message).filter(|m| !m.trim().is_empty()))
        .unwrap_or_else(|| generic_message(kind, provider));

    tracing::debug!(
        provider = %provider,
        status = status,
        code = ?code,
        kind = %kind,
        "Mapped provider error response"
    );

    GenerationError::new(kind, message)
}

/// Per-backend table of machine-readable error codes.
fn code_message(provider: ProviderKind, code: &str) -> Option<&'static str> {
    let message = match provider {
        ProviderKind::Gemini => match code {
            "INVALID_ARGUMENT" => "Gemini rejected the request parameters.",
            "FAILED_PRECONDITION" => "Gemini is not available for this key or region.",
            "PERMISSION_DENIED" => "The Gemini API key does not have access to this model.",
            "NOT_FOUND" => "The selected Gemini model was not found.",
            "RESOURCE_EXHAUSTED" => "Gemini rate limit reached. Try again later.",
            "INTERNAL" | "UNAVAILABLE" => "Gemini is temporarily unavailable.",
            "DEADLINE_EXCEEDED" => "Gemini took too long to respond.",
            _ => return None,
        },
        ProviderKind::OpenAi | ProviderKind::OpenRouter | ProviderKind::Groq => match code {
            "invalid_api_key" => "The API key was rejected.",
            "context_length_exceeded" => "The prompt is too long for this model's context window.",
            "model_not_found" => "The selected model was not found.",
            "insufficient_quota" => "The account has no remaining credit or quota.",
            "rate_limit_exceeded" => "Rate limit reached. Try again later.",
            "unsupported_parameter" | "unsupported_value" => {
                "The model does not support one of the sampling settings."
            }
            "server_error" => "The provider had an internal error.",
            _ => return None,
        },
    };
    Some(message)
}

fn generic_message(kind: ErrorKind, provider: ProviderKind) -> String {
    match kind {
        ErrorKind::Authorization => format!("{provider} rejected the credential."),
        ErrorKind::RateLimited => format!("{provider} is rate limiting requests. Try again later."),
        ErrorKind::TransientTransport => format!("{provider} is temporarily unavailable."),
        _ => format!("{provider} rejected the request."),
    }
}
