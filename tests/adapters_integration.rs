//! Mock-based provider tests.
//!
//! Every adapter runs against a wiremock server standing in for the real
//! endpoint, driven end to end through the generation coordinator.

use std::sync::Arc;
use std::time::Duration;

use artifact_forge::artifact::{ArtifactSection, ArtifactVersionStore};
use artifact_forge::error::ErrorKind;
use artifact_forge::llm::background::PollerConfig;
use artifact_forge::llm::catalog::ModelCatalog;
use artifact_forge::llm::client::ProviderClient;
use artifact_forge::llm::registry::build_adapter;
use artifact_forge::llm::retry::RetryPolicy;
use artifact_forge::llm::tokens::{TokenEstimator, TokenUsage};
use artifact_forge::llm::{
    GenerationCoordinator, GenerationOutcome, GenerationRequest, ProviderAdapter, ProviderKind,
    ProviderRegistry,
};
use artifact_forge::normalized::StreamEvent;
use serde_json::json;
use tokio::sync::Mutex;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter(kind: ProviderKind, server: &MockServer) -> Arc<dyn ProviderAdapter> {
    let descriptor = kind.descriptor().with_base_url(server.uri());
    build_adapter(ProviderClient::new(descriptor, Some("test-key".to_string())))
}

fn coordinator(adapter: Arc<dyn ProviderAdapter>) -> GenerationCoordinator {
    let mut registry = ProviderRegistry::new();
    registry.insert(adapter);
    GenerationCoordinator::new(
        Arc::new(registry),
        Arc::new(Mutex::new(ArtifactVersionStore::new())),
        Arc::new(Mutex::new(TokenUsage::default())),
    )
    .with_retry_policy(
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(0.0),
    )
    .with_poller_config(PollerConfig {
        poll_interval: Some(Duration::from_millis(10)),
        ..PollerConfig::default()
    })
}

fn sse(payloads: &[serde_json::Value], done: bool) -> String {
    let mut body: String = payloads.iter().map(|p| format!("data: {p}\n\n")).collect();
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

async fn run(
    coordinator: &GenerationCoordinator,
    provider: ProviderKind,
    request: GenerationRequest,
) -> (GenerationOutcome, Vec<StreamEvent>) {
    let mut events = Vec::new();
    let outcome = coordinator
        .run(ArtifactSection::Research, provider, request, |e| events.push(e.clone()))
        .await;
    (outcome, events)
}

fn chunks(events: &[StreamEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

async fn current_text(coordinator: &GenerationCoordinator) -> Option<String> {
    coordinator
        .store()
        .lock()
        .await
        .current(ArtifactSection::Research)
        .map(|v| v.content.clone())
}

// ============================================================================
// Chat Completions (Groq, OpenRouter)
// ============================================================================

mod chat_completions {
    use super::*;

    #[tokio::test]
    async fn test_streams_hello_world_and_commits() {
        let server = MockServer::start().await;
        let body = sse(
            &[
                json!({ "choices": [{ "delta": { "content": "Hello" } }] }),
                json!({ "choices": [{ "delta": { "content": " world" }, "finish_reason": "stop" }] }),
                json!({ "choices": [], "usage": { "prompt_tokens": 7, "completion_tokens": 2 } }),
            ],
            true,
        );

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "stream": true, "model": "llama-3.3-70b-versatile" })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::Groq, &server));
        let request = GenerationRequest::new("Say hello", "llama-3.3-70b-versatile");
        let (outcome, events) = run(&coordinator, ProviderKind::Groq, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert_eq!(chunks(&events), ["Hello", " world"]);
        assert_eq!(current_text(&coordinator).await.as_deref(), Some("Hello world"));

        let usage = *coordinator.usage().lock().await;
        assert_eq!((usage.input, usage.output), (7, 2));
        assert!(usage.estimated_cost > 0.0);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "Invalid API Key", "code": "invalid_api_key" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::Groq, &server));
        let request = GenerationRequest::new("Say hello", "llama-3.3-70b-versatile");
        let (outcome, events) = run(&coordinator, ProviderKind::Groq, request).await;

        let GenerationOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Status { .. })));
        assert!(coordinator.store().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_is_retried_to_exhaustion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenRouter, &server));
        let request = GenerationRequest::new("Say hello", "deepseek/deepseek-chat-v3.1");
        let (outcome, events) = run(&coordinator, ProviderKind::OpenRouter, request).await;

        let GenerationOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::TransientTransport);
        let statuses = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Status { .. }))
            .count();
        assert_eq!(statuses, 2);
    }

    #[tokio::test]
    async fn test_openrouter_citations_are_deduplicated() {
        let server = MockServer::start().await;
        let citation = json!({
            "type": "url_citation",
            "url_citation": { "url": "https://example.com/a", "title": "A" }
        });
        let body = sse(
            &[
                json!({ "choices": [{ "delta": { "content": "Cited", "annotations": [citation] } }] }),
                json!({ "choices": [{ "delta": { "content": ".", "annotations": [citation] } }] }),
            ],
            true,
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenRouter, &server));
        let request = GenerationRequest::new("Research", "google/gemini-2.5-pro").with_grounding(true);
        let (outcome, events) = run(&coordinator, ProviderKind::OpenRouter, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        let Some(StreamEvent::Done { sources, .. }) = events.last() else {
            panic!("expected done");
        };
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].uri, "https://example.com/a");
    }
}

// ============================================================================
// Responses API and background deep research (OpenAI)
// ============================================================================

mod responses {
    use super::*;

    #[tokio::test]
    async fn test_streams_semantic_events() {
        let server = MockServer::start().await;
        let body = sse(
            &[
                json!({ "type": "response.created", "response": { "id": "resp_1" } }),
                json!({ "type": "response.output_text.delta", "delta": "Market " }),
                json!({ "type": "response.output_text.delta", "delta": "overview" }),
                json!({
                    "type": "response.completed",
                    "response": { "id": "resp_1", "status": "completed",
                                  "usage": { "input_tokens": 11, "output_tokens": 3 } }
                }),
            ],
            false,
        );
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenAi, &server));
        let request = GenerationRequest::new("Summarize the market", "gpt-5-mini");
        let (outcome, events) = run(&coordinator, ProviderKind::OpenAi, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert_eq!(chunks(&events), ["Market ", "overview"]);
        assert_eq!(coordinator.usage().lock().await.input, 11);
    }

    #[tokio::test]
    async fn test_response_failed_is_mid_stream_error() {
        let server = MockServer::start().await;
        let body = sse(
            &[
                json!({ "type": "response.output_text.delta", "delta": "Part" }),
                json!({
                    "type": "response.failed",
                    "response": { "status": "failed", "error": { "message": "Model overloaded" } }
                }),
            ],
            false,
        );
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenAi, &server));
        let request = GenerationRequest::new("Summarize", "gpt-5");
        let (outcome, _) = run(&coordinator, ProviderKind::OpenAi, request).await;

        let GenerationOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::MidStreamFailure);
        assert_eq!(err.message(), "Model overloaded");
        assert!(coordinator.store().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_deep_research_polls_until_completed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(body_partial_json(json!({ "background": true, "model": "o3-deep-research" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_bg", "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/responses/resp_bg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_bg", "status": "in_progress"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/responses/resp_bg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_bg",
                "status": "completed",
                "output": [{
                    "type": "message",
                    "content": [{
                        "type": "output_text",
                        "text": "Deep findings.",
                        "annotations": [
                            { "type": "url_citation", "url": "https://example.org/r", "title": "Report" }
                        ]
                    }]
                }],
                "usage": { "input_tokens": 100, "output_tokens": 50 }
            })))
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenAi, &server));
        let request = GenerationRequest::new("Research the market", "o3-deep-research");
        let (outcome, events) = run(&coordinator, ProviderKind::OpenAi, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert_eq!(current_text(&coordinator).await.as_deref(), Some("Deep findings."));

        let elapsed_statuses = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Status { message } if message.contains("elapsed")))
            .count();
        assert_eq!(elapsed_statuses, 2);

        let Some(StreamEvent::Done { sources, .. }) = events.last() else {
            panic!("expected done");
        };
        assert_eq!(sources[0].title, "Report");
    }

    #[tokio::test]
    async fn test_deep_research_failure_is_task_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "resp_f", "status": "queued" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/responses/resp_f"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_f", "status": "failed", "error": { "message": "quota exhausted" }
            })))
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::OpenAi, &server));
        let request = GenerationRequest::new("Research", "o4-mini-deep-research");
        let (outcome, _) = run(&coordinator, ProviderKind::OpenAi, request).await;

        let GenerationOutcome::Failed(err) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.message().contains("quota exhausted"));
    }
}

// ============================================================================
// Gemini
// ============================================================================

mod gemini {
    use super::*;

    #[tokio::test]
    async fn test_streams_with_grounding_sources() {
        let server = MockServer::start().await;
        let body = sse(
            &[
                json!({ "candidates": [{ "content": { "parts": [{ "text": "Grounded " }] } }] }),
                json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "answer" }] },
                        "finishReason": "STOP",
                        "groundingMetadata": { "groundingChunks": [
                            { "web": { "uri": "https://example.net/g", "title": "example.net" } }
                        ] }
                    }],
                    "usageMetadata": { "promptTokenCount": 9, "candidatesTokenCount": 2 }
                }),
            ],
            false,
        );

        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({ "tools": [{ "google_search": {} }] })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::Gemini, &server));
        let request = GenerationRequest::new("What is new?", "gemini-2.5-flash").with_grounding(true);
        let (outcome, events) = run(&coordinator, ProviderKind::Gemini, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert_eq!(chunks(&events), ["Grounded ", "answer"]);
        let Some(StreamEvent::Done { sources, usage, .. }) = events.last() else {
            panic!("expected done");
        };
        assert_eq!(sources[0].uri, "https://example.net/g");
        assert_eq!(usage.map(|u| u.input_tokens), Some(9));
        assert_eq!(coordinator.usage().lock().await.grounding_requests, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": { "code": 429, "message": "Quota", "status": "RESOURCE_EXHAUSTED" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse(&[json!({ "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }] })], false),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let coordinator = coordinator(adapter(ProviderKind::Gemini, &server));
        let request = GenerationRequest::new("Hi", "gemini-2.5-pro");
        let (outcome, events) = run(&coordinator, ProviderKind::Gemini, request).await;

        assert_eq!(outcome, GenerationOutcome::Committed { index: 0 });
        assert!(matches!(&events[0], StreamEvent::Status { message } if message.contains("attempt 2 of 3")));
    }

    #[tokio::test]
    async fn test_count_tokens_falls_back_to_estimate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:countTokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "totalTokens": 42 })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:countTokens"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = adapter(ProviderKind::Gemini, &server);
        let estimator = TokenEstimator::default();
        let text = "twelve chars";

        assert_eq!(estimator.exact_count(adapter.as_ref(), text, "gemini-2.5-flash").await, 42);
        assert_eq!(estimator.exact_count(adapter.as_ref(), text, "gemini-2.5-flash").await, 3);
    }

    #[tokio::test]
    async fn test_model_catalog_caches_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1beta/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    { "name": "models/gemini-2.5-flash", "supportedGenerationMethods": ["generateContent"] },
                    { "name": "models/text-embedding-004", "supportedGenerationMethods": ["embedContent"] }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(ProviderKind::Gemini, &server);
        let catalog = ModelCatalog::new(Duration::from_secs(60));

        let first = catalog.models(adapter.as_ref()).await;
        let second = catalog.models(adapter.as_ref()).await;

        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "gemini-2.5-flash");
        assert!(first[0].input_per_million > 0.0);
    }
}
