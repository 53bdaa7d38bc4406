use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use credmux_common::ModelId;
use credmux_provider::{Credential, ProviderRegistry};
use tokio::sync::OnceCell;

use crate::table::ModelTable;

#[derive(Debug, Clone)]
pub struct ModelCacheConfig {
    pub refresh_interval: Duration,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(6 * 3600),
        }
    }
}

/// Periodically calls `list_models` across every (provider, credential)
/// pair and merges the result into a pointer-swapped lookup table
/// (spec.md §4.E). Lookups block on the first population; every refresh
/// after that swaps the table without blocking readers.
pub struct ModelCache {
    registry: Arc<ProviderRegistry>,
    /// provider tag -> [(ledger credential key, plugin credential)].
    credentials: HashMap<String, Vec<(String, Credential)>>,
    table: ArcSwap<ModelTable>,
    ready: OnceCell<()>,
    config: ModelCacheConfig,
}

impl ModelCache {
    /// Builds the cache and blocks until the first population completes,
    /// then spawns the background refresh loop.
    pub async fn start(
        registry: Arc<ProviderRegistry>,
        credentials: HashMap<String, Vec<(String, Credential)>>,
        config: ModelCacheConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            registry,
            credentials,
            table: ArcSwap::from_pointee(ModelTable::default()),
            ready: OnceCell::new(),
            config,
        });

        cache.ensure_ready().await;

        let weak = Arc::downgrade(&cache);
        let interval = cache.config.refresh_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(cache) = weak.upgrade() else { return };
                cache.populate().await;
            }
        });

        cache
    }

    async fn ensure_ready(&self) {
        self.ready.get_or_init(|| self.populate()).await;
    }

    /// Candidate credential keys for a qualified model, blocking callers
    /// that arrive before the first population finishes.
    pub async fn candidates(&self, model: &ModelId) -> Vec<String> {
        self.ensure_ready().await;
        self.table
            .load()
            .model_to_credentials
            .get(&model.qualified())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn models_for_provider(&self, provider: &str) -> Vec<ModelId> {
        self.ensure_ready().await;
        self.table
            .load()
            .provider_to_models
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    async fn populate(&self) {
        let mut model_to_credentials: HashMap<String, Vec<String>> = HashMap::new();
        let mut provider_to_models: HashMap<String, Vec<ModelId>> = HashMap::new();

        for (provider_name, creds) in &self.credentials {
            let Some(provider) = self.registry.get(provider_name) else {
                tracing::warn!(provider = %provider_name, "no registered plugin for provider, skipping");
                continue;
            };

            for (credential_key, credential) in creds {
                match provider.list_models(credential).await {
                    Ok(models) => {
                        for model in models {
                            model_to_credentials
                                .entry(model.qualified())
                                .or_default()
                                .push(credential_key.clone());
                            provider_to_models
                                .entry(provider_name.clone())
                                .or_default()
                                .push(model);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            provider = %provider_name,
                            credential = %credential_key,
                            error = %err,
                            "list_models failed, omitting this pair from the refresh"
                        );
                    }
                }
            }
        }

        self.table.store(Arc::new(ModelTable {
            model_to_credentials,
            provider_to_models,
        }));
    }
}
