//! In-memory project storage.
//!
//! A project owns one [`ArtifactVersionStore`], one [`TokenUsage`] tally and
//! the [`GenerationCoordinator`] that writes to them. Projects are identified
//! by UUID. Persistence is left to the caller, which can export and import
//! the store through [`Project::snapshot`] and [`ProjectStore::create_from`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifact::ArtifactVersionStore;
use crate::llm::background::PollerConfig;
use crate::llm::retry::RetryPolicy;
use crate::llm::tokens::{TokenEstimator, TokenUsage};
use crate::llm::{GenerationCoordinator, GenerationState, ProviderRegistry};

/// A single project.
#[derive(Debug, Clone)]
pub struct Project {
    inner: Arc<ProjectInner>,
}

#[derive(Debug)]
struct ProjectInner {
    id: String,
    created_at: DateTime<Utc>,
    coordinator: GenerationCoordinator,
}

/// Serializable view of a project at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub id: String,
    /// RFC 3339
    pub created_at: String,
    pub state: GenerationState,
    pub usage: TokenUsage,
    pub artifacts: ArtifactVersionStore,
}

impl Project {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    #[must_use]
    pub fn coordinator(&self) -> &GenerationCoordinator {
        &self.inner.coordinator
    }

    pub async fn snapshot(&self) -> ProjectSnapshot {
        let coordinator = &self.inner.coordinator;
        let artifacts = coordinator.store().lock().await.clone();
        let usage = *coordinator.usage().lock().await;
        ProjectSnapshot {
            id: self.inner.id.clone(),
            created_at: self.inner.created_at.to_rfc3339(),
            state: coordinator.state(),
            usage,
            artifacts,
        }
    }

    /// Start a fresh usage tally, as when the user switches to this project.
    pub async fn reset_usage(&self) {
        self.inner.coordinator.usage().lock().await.reset();
    }

    /// Stop any generation and drop all artifact history.
    async fn discard(&self) {
        let coordinator = &self.inner.coordinator;
        coordinator.cancel();
        coordinator.store().lock().await.clear();
        coordinator.usage().lock().await.reset();
    }
}

/// Generation settings shared by every project.
#[derive(Debug, Clone)]
pub struct ProjectDefaults {
    pub registry: Arc<ProviderRegistry>,
    pub retry: RetryPolicy,
    pub poller: PollerConfig,
    pub estimator: TokenEstimator,
}

impl ProjectDefaults {
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            poller: PollerConfig::default(),
            estimator: TokenEstimator::default(),
        }
    }

    fn coordinator(&self, store: ArtifactVersionStore) -> GenerationCoordinator {
        GenerationCoordinator::new(
            Arc::clone(&self.registry),
            Arc::new(Mutex::new(store)),
            Arc::new(Mutex::new(TokenUsage::default())),
        )
        .with_retry_policy(self.retry)
        .with_poller_config(self.poller)
        .with_estimator(self.estimator)
    }
}

/// Thread-safe store for projects.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    inner: Arc<ProjectStoreInner>,
}

#[derive(Debug)]
struct ProjectStoreInner {
    defaults: ProjectDefaults,
    projects: RwLock<HashMap<String, Project>>,
}

impl ProjectStore {
    #[must_use]
    pub fn new(defaults: ProjectDefaults) -> Self {
        Self {
            inner: Arc::new(ProjectStoreInner {
                defaults,
                projects: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create an empty project with a fresh id.
    #[must_use]
    pub fn create(&self) -> Project {
        self.create_from(Uuid::new_v4().to_string(), ArtifactVersionStore::new())
    }

    /// Create (or replace) a project seeded with previously saved artifacts.
    #[must_use]
    pub fn create_from(&self, id: impl Into<String>, artifacts: ArtifactVersionStore) -> Project {
        let id = id.into();
        let project = Project {
            inner: Arc::new(ProjectInner {
                id: id.clone(),
                created_at: Utc::now(),
                coordinator: self.inner.defaults.coordinator(artifacts),
            }),
        };
        self.inner
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, project.clone());
        tracing::debug!(project_id = %project.id(), "Created project");
        project
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Project> {
        self.inner
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Project {
        if let Some(project) = self.get(id) {
            return project;
        }
        self.create_from(id, ArtifactVersionStore::new())
    }

    /// Delete a project, cancelling its generation and clearing its history.
    pub async fn remove(&self, id: &str) -> Option<Project> {
        let removed = self
            .inner
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(project) = &removed {
            project.discard().await;
            tracing::debug!(project_id = %id, "Deleted project");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn list_ids(&self) -> Vec<String> {
        self.inner
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
