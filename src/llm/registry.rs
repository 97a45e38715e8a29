//! Provider lookup table.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::client::ProviderClient;
use super::provider::ProviderKind;
use super::{ChatCompletionsAdapter, GeminiAdapter, ProviderAdapter, ResponsesAdapter};
use crate::config::ProvidersConfig;
use crate::error::{GenerationError, Result};

/// One adapter per [`ProviderKind`], built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The adapter implementing `kind`'s wire protocol.
#[must_use]
pub fn build_adapter(client: ProviderClient) -> Arc<dyn ProviderAdapter> {
    match client.descriptor().kind {
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(client)),
        ProviderKind::OpenAi => Arc::new(ResponsesAdapter::new(client)),
        ProviderKind::OpenRouter | ProviderKind::Groq => Arc::new(ChatCompletionsAdapter::new(client)),
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every provider, applying base-url and credential overrides.
    ///
    /// Providers without a credential are still registered; their calls fail
    /// with a configuration error naming the missing variable.
    #[must_use]
    pub fn from_config(providers: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::ALL {
            let mut descriptor = kind.descriptor();
            if let Some(base_url) = &providers.get(kind).base_url {
                descriptor = descriptor.with_base_url(base_url.clone());
            }
            let credential = providers.credential(kind);
            tracing::debug!(
                provider = %kind,
                base_url = %descriptor.base_url,
                has_credential = credential.is_some(),
                "Registering provider"
            );
            registry.insert(build_adapter(ProviderClient::new(descriptor, credential)));
        }
        registry
    }

    /// Add or replace the adapter for its descriptor's kind.
    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.descriptor().kind, adapter);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .map(Arc::clone)
            .ok_or_else(|| GenerationError::configuration(format!("Provider {kind} is not configured")))
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.adapters.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;

    #[test]
    fn test_from_config_covers_every_provider() {
        let providers = ProvidersConfig {
            groq: ProviderConfig {
                api_key: Some("gsk".into()),
                base_url: Some("http://127.0.0.1:9999".into()),
            },
            ..ProvidersConfig::default()
        };
        let registry = ProviderRegistry::from_config(&providers);

        assert_eq!(registry.kinds().count(), 4);
        let groq = registry.get(ProviderKind::Groq).unwrap();
        assert_eq!(groq.descriptor().base_url, "http://127.0.0.1:9999");
        assert_eq!(
            registry.get(ProviderKind::OpenAi).unwrap().descriptor().kind,
            ProviderKind::OpenAi
        );
    }

    #[test]
    fn test_missing_provider_is_configuration_error() {
        let Err(err) = ProviderRegistry::new().get(ProviderKind::Gemini) else {
            panic!("expected a configuration error");
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
