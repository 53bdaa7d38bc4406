//! The provider plugin abstraction (spec.md §4.D): a per-upstream adapter
//! for model listing, request translation, and optional OAuth-style
//! credential refresh.

mod credential;
mod error;
mod oauth;
mod oauth_plugin;
mod openai_compatible;
mod plugin;
mod registry;
mod request;

pub use credential::Credential;
pub use error::{ProviderError, ProviderResult, UpstreamFailure};
pub use oauth::{OAuthCredentialFile, OAuthStore};
pub use oauth_plugin::OAuthPlugin;
pub use openai_compatible::OpenAiCompatiblePlugin;
pub use plugin::Provider;
pub use registry::ProviderRegistry;
pub use request::{
    ChunkStream, CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderResponse, ProviderUsage,
};
