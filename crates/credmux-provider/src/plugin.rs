use async_trait::async_trait;
use credmux_common::ModelId;

use crate::credential::Credential;
use crate::error::ProviderResult;
use crate::request::{CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderResponse};

/// Per-upstream adapter. Every plugin registered with a
/// [`crate::registry::ProviderRegistry`] implements this.
///
/// Qualified model names (`provider/model-id`) are the only identifier that
/// crosses this boundary; a plugin's raw, unqualified model ids never leak
/// out of `list_models`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// `true` if this plugin bypasses the shared OpenAI-compatible HTTP
    /// translator and speaks its own wire protocol end to end.
    fn has_custom_logic(&self) -> bool {
        false
    }

    async fn list_models(&self, credential: &Credential) -> ProviderResult<Vec<ModelId>>;

    async fn completion(
        &self,
        credential: &Credential,
        request: CompletionRequest,
    ) -> ProviderResult<CompletionOutcome>;

    async fn embedding(
        &self,
        credential: &Credential,
        request: EmbeddingRequest,
    ) -> ProviderResult<ProviderResponse>;

    /// Forces a refresh for OAuth-like credentials. A no-op for plugins
    /// whose credential is a bare API key.
    async fn refresh(&self, _credential: &Credential) -> ProviderResult<()> {
        Ok(())
    }
}
