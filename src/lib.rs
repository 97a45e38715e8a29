//! Artifact Forge
//!
//! Multi-provider generation orchestration for a research → requirements →
//! design → build-plan workflow. Every step's artifact is produced by a
//! third-party LLM and kept as an immutable, navigable version history.
//!
//! # Architecture
//!
//! - **Providers**: Gemini, `OpenAI` (Responses + background deep research),
//!   `OpenRouter` and Groq reduced to one streaming contract
//! - **Resilience**: retry with backoff on connect, cancellation everywhere,
//!   create-then-poll driver for long-running research tasks
//! - **Storage**: append-only per-section version history with a cursor
//! - **Server**: Axum HTTP/SSE façade over per-project coordinators
//!
//! # Modules
//!
//! - [`llm`]: provider adapters, retry, polling, tokens and the coordinator
//! - [`artifact`]: the artifact version store
//! - [`normalized`]: unified streaming event model
//! - [`project`]: in-memory project management
//! - [`server`]: HTTP routes

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod artifact;
pub mod config;
pub mod error;
pub mod llm;
pub mod normalized;
pub mod project;
pub mod server;

use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::llm::ProviderRegistry;
use crate::llm::catalog::ModelCatalog;
use crate::llm::tokens::TokenEstimator;
use crate::project::ProjectStore;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Per-project stores and coordinators.
    pub projects: ProjectStore,
    /// One adapter per provider.
    pub registry: Arc<ProviderRegistry>,
    /// Cached model lists.
    pub catalog: Arc<ModelCatalog>,
    pub estimator: TokenEstimator,
    /// Defaults for requests that omit provider or model.
    pub generation: Arc<GenerationConfig>,
}
