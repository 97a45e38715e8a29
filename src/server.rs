use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::artifact::{ArtifactSection, ArtifactVersion};
use crate::config::AppConfig;
use crate::error::{ErrorKind, GenerationError};
use crate::llm::catalog::ModelCatalog;
use crate::llm::tokens::TokenEstimator;
use crate::llm::{GenerationRequest, ModelInfo, ProviderKind, ProviderRegistry, SafetyPreset, SamplingSettings};
use crate::normalized::sse_event;
use crate::project::{Project, ProjectDefaults, ProjectSnapshot, ProjectStore};

type ApiError = (StatusCode, String);

/// Build the shared state from configuration.
#[must_use]
pub fn build_state(config: &AppConfig) -> AppState {
    let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
    let estimator = TokenEstimator::new(config.generation.chars_per_token);
    let defaults = ProjectDefaults {
        registry: Arc::clone(&registry),
        retry: config.generation.retry,
        poller: config.generation.poller,
        estimator,
    };

    AppState {
        projects: ProjectStore::new(defaults),
        registry,
        catalog: Arc::new(ModelCatalog::new(std::time::Duration::from_secs(
            config.generation.catalog_ttl_secs,
        ))),
        estimator,
        generation: Arc::new(config.generation.clone()),
    }
}

/// All API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/projects", get(api_list_projects).post(api_create_project))
        .route("/api/projects/{id}", get(api_get_project).delete(api_delete_project))
        .route("/api/projects/{id}/generate", post(api_generate))
        .route("/api/projects/{id}/cancel", post(api_cancel))
        .route("/api/projects/{id}/usage", get(api_get_usage))
        .route("/api/projects/{id}/usage/reset", post(api_reset_usage))
        .route(
            "/api/projects/{id}/artifacts/{section}",
            get(api_get_artifact).post(api_commit_artifact),
        )
        .route("/api/projects/{id}/artifacts/{section}/versions", get(api_list_versions))
        .route("/api/projects/{id}/artifacts/{section}/cycle", post(api_cycle_artifact))
        .route("/api/providers/{provider}/models", get(api_list_models))
        .route("/api/providers/{provider}/count-tokens", post(api_count_tokens))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let state = build_state(&config);

    for kind in state.registry.kinds() {
        info!(
            name: "provider.registered",
            provider = %kind,
            has_credential = config.providers.credential(kind).is_some(),
            "Provider registered"
        );
    }

    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────────────────────────

fn project(state: &AppState, id: &str) -> Result<Project, ApiError> {
    state
        .projects
        .get(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Project {id} not found")))
}

/// GET /api/projects - List project ids.
async fn api_list_projects(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut ids = state.projects.list_ids();
    ids.sort();
    Json(ids)
}

/// POST /api/projects - Create an empty project.
async fn api_create_project(State(state): State<AppState>) -> (StatusCode, Json<ProjectSnapshot>) {
    let project = state.projects.create();
    (StatusCode::CREATED, Json(project.snapshot().await))
}

/// GET /api/projects/:id - Full project state, including all artifacts.
async fn api_get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectSnapshot>, ApiError> {
    Ok(Json(project(&state, &id)?.snapshot().await))
}

/// DELETE /api/projects/:id - Delete a project and its history.
async fn api_delete_project(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match state.projects.remove(&id).await {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for a generation.
#[derive(Debug, Deserialize)]
struct GenerateBody {
    section: ArtifactSection,
    prompt: String,
    #[serde(default)]
    provider: Option<ProviderKind>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_instruction: Option<String>,
    #[serde(default)]
    sampling: SamplingSettings,
    #[serde(default)]
    grounding: bool,
    #[serde(default)]
    thinking_budget: Option<u32>,
    #[serde(default)]
    safety: SafetyPreset,
}

/// POST /api/projects/:id/generate - Start a generation and stream its events.
async fn api_generate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GenerateBody>,
) -> Result<Response, ApiError> {
    let project = project(&state, &id)?;
    let coordinator = project.coordinator();

    let provider = body.provider.unwrap_or(state.generation.default_provider);
    let model = body.model.unwrap_or_else(|| state.generation.model_for(provider));
    let mut request = GenerationRequest::new(body.prompt, model)
        .with_sampling(body.sampling)
        .with_grounding(body.grounding)
        .with_thinking_budget(body.thinking_budget)
        .with_safety(body.safety);
    if let Some(instruction) = body.system_instruction {
        request = request.with_system_instruction(instruction);
    }

    tracing::info!(
        project_id = %id,
        section = %body.section,
        provider = %provider,
        model = %request.model_id,
        "Received generation request"
    );

    let events = coordinator
        .try_generate(body.section, provider, request)
        .map_err(|e| (StatusCode::CONFLICT, e.message().to_string()))?
        .map(|event| Ok::<String, Infallible>(sse_event(&event)));

    Ok(build_sse_response(axum::body::Body::from_stream(events)))
}

/// POST /api/projects/:id/cancel - Cancel the running generation, if any.
async fn api_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    project(&state, &id)?.coordinator().cancel();
    Ok(StatusCode::NO_CONTENT)
}

fn build_sse_response(body: axum::body::Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    resp
}

// ─────────────────────────────────────────────────────────────────────────────
// Artifacts
// ─────────────────────────────────────────────────────────────────────────────

/// Cursor view of one section.
#[derive(Debug, Serialize)]
struct ArtifactView {
    section: ArtifactSection,
    /// One-based position, e.g. "2/3".
    label: String,
    current_index: usize,
    version_count: usize,
    current: Option<ArtifactVersion>,
}

async fn artifact_view(project: &Project, section: ArtifactSection) -> ArtifactView {
    let store = project.coordinator().store().lock().await;
    ArtifactView {
        section,
        label: store.version_label(section),
        current_index: store.current_index(section),
        version_count: store.len(section),
        current: store.current(section).cloned(),
    }
}

/// GET /api/projects/:id/artifacts/:section - The version under the cursor.
async fn api_get_artifact(
    State(state): State<AppState>,
    Path((id, section)): Path<(String, ArtifactSection)>,
) -> Result<Json<ArtifactView>, ApiError> {
    let project = project(&state, &id)?;
    Ok(Json(artifact_view(&project, section).await))
}

/// GET /api/projects/:id/artifacts/:section/versions - Full history.
async fn api_list_versions(
    State(state): State<AppState>,
    Path((id, section)): Path<(String, ArtifactSection)>,
) -> Result<Json<Vec<ArtifactVersion>>, ApiError> {
    let project = project(&state, &id)?;
    let store = project.coordinator().store().lock().await;
    Ok(Json(store.versions(section).to_vec()))
}

#[derive(Debug, Deserialize)]
struct CycleBody {
    delta: isize,
}

/// POST /api/projects/:id/artifacts/:section/cycle - Move the cursor.
async fn api_cycle_artifact(
    State(state): State<AppState>,
    Path((id, section)): Path<(String, ArtifactSection)>,
    Json(body): Json<CycleBody>,
) -> Result<Json<ArtifactView>, ApiError> {
    let project = project(&state, &id)?;
    project.coordinator().store().lock().await.cycle(section, body.delta);
    Ok(Json(artifact_view(&project, section).await))
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    content: String,
}

/// POST /api/projects/:id/artifacts/:section - Commit a manual edit.
async fn api_commit_artifact(
    State(state): State<AppState>,
    Path((id, section)): Path<(String, ArtifactSection)>,
    Json(body): Json<CommitBody>,
) -> Result<(StatusCode, Json<ArtifactView>), ApiError> {
    let project = project(&state, &id)?;
    project.coordinator().commit_manual(section, body.content).await;
    Ok((StatusCode::CREATED, Json(artifact_view(&project, section).await)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Usage and providers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/projects/:id/usage - Token and cost tally.
async fn api_get_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = project(&state, &id)?;
    let usage = *project.coordinator().usage().lock().await;
    Ok(Json(usage))
}

/// POST /api/projects/:id/usage/reset - Start a new tally.
async fn api_reset_usage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    project(&state, &id)?.reset_usage().await;
    Ok(StatusCode::NO_CONTENT)
}

fn status_for(err: &GenerationError) -> StatusCode {
    match err.kind() {
        ErrorKind::Configuration | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Aborted => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    refresh: bool,
}

/// GET /api/providers/:provider/models - Cached model list.
async fn api_list_models(
    State(state): State<AppState>,
    Path(provider): Path<ProviderKind>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    let adapter = state
        .registry
        .get(provider)
        .map_err(|e| (status_for(&e), e.to_string()))?;

    if query.refresh {
        let models = state.catalog.refetch(adapter.as_ref()).await.map_err(|e| {
            tracing::error!(provider = %provider, error = %e, "Failed to refresh models");
            (status_for(&e), e.to_string())
        })?;
        return Ok(Json(models));
    }
    Ok(Json(state.catalog.models(adapter.as_ref()).await))
}

#[derive(Debug, Deserialize)]
struct CountTokensBody {
    text: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct CountTokensResponse {
    estimate: u64,
    exact: u64,
}

/// POST /api/providers/:provider/count-tokens - Estimate and exact count.
async fn api_count_tokens(
    State(state): State<AppState>,
    Path(provider): Path<ProviderKind>,
    Json(body): Json<CountTokensBody>,
) -> Result<Json<CountTokensResponse>, ApiError> {
    let adapter = state
        .registry
        .get(provider)
        .map_err(|e| (status_for(&e), e.to_string()))?;
    let model = body.model.unwrap_or_else(|| state.generation.model_for(provider));

    Ok(Json(CountTokensResponse {
        estimate: state.estimator.estimate(&body.text),
        exact: state
            .estimator
            .exact_count(adapter.as_ref(), &body.text, &model)
            .await,
    }))
}
