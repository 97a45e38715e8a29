//! TTL cache of provider model lists.
//!
//! Built once at startup and shared by reference. A failed fetch falls back
//! to the descriptor's default models and is not cached, so the next call
//! tries the network again.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::ProviderAdapter;
use super::provider::{ModelInfo, ProviderKind};
use crate::error::Result;

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct CachedModels {
    models: Vec<ModelInfo>,
    fetched_at: Instant,
}

/// Per-provider model lists with a freshness window.
#[derive(Debug)]
pub struct ModelCatalog {
    ttl: Duration,
    entries: RwLock<BTreeMap<ProviderKind, CachedModels>>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ModelCatalog {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Cached models if still fresh, otherwise a refetch. Never fails.
    pub async fn models(&self, adapter: &dyn ProviderAdapter) -> Vec<ModelInfo> {
        let kind = adapter.descriptor().kind;
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&kind)
                && cached.fetched_at.elapsed() < self.ttl
            {
                return cached.models.clone();
            }
        }

        match self.refetch(adapter).await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(provider = %kind, error = %e, "Model listing failed, using defaults");
                adapter.descriptor().models.clone()
            }
        }
    }

    /// Fetch from the provider and replace the cache entry.
    pub async fn refetch(&self, adapter: &dyn ProviderAdapter) -> Result<Vec<ModelInfo>> {
        let kind = adapter.descriptor().kind;
        let mut models = adapter.list_models().await?;
        if models.is_empty() {
            models.clone_from(&adapter.descriptor().models);
        }
        tracing::debug!(provider = %kind, count = models.len(), "Model list refreshed");

        self.entries.write().await.insert(
            kind,
            CachedModels {
                models: models.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(models)
    }

    /// Drop the cached list for one provider.
    pub async fn invalidate(&self, kind: ProviderKind) {
        self.entries.write().await.remove(&kind);
    }
}
