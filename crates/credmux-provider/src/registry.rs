use std::collections::HashMap;
use std::sync::Arc;

use crate::plugin::Provider;

/// A closed, startup-built registry of named provider adapters, grounded on
/// the `provider_factory` shape used throughout the Python rotation library
/// this core was distilled from: one concrete plugin per upstream, looked
/// up by its provider tag.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::error::ProviderResult;
    use crate::request::{CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderResponse};
    use async_trait::async_trait;
    use credmux_common::ModelId;

    struct StubProvider(&'static str);

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            self.0
        }

        async fn list_models(&self, _credential: &Credential) -> ProviderResult<Vec<ModelId>> {
            Ok(vec![])
        }

        async fn completion(
            &self,
            _credential: &Credential,
            _request: CompletionRequest,
        ) -> ProviderResult<CompletionOutcome> {
            unimplemented!()
        }

        async fn embedding(
            &self,
            _credential: &Credential,
            _request: EmbeddingRequest,
        ) -> ProviderResult<ProviderResponse> {
            unimplemented!()
        }
    }

    #[test]
    fn registers_and_looks_up_by_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(std::sync::Arc::new(StubProvider("openai")));
        registry.register(std::sync::Arc::new(StubProvider("anthropic")));

        assert!(registry.get("openai").is_some());
        assert!(registry.get("missing").is_none());
        let mut names: Vec<&str> = registry.names().collect();
        names.sort();
        assert_eq!(names, vec!["anthropic", "openai"]);
    }
}
