use std::pin::Pin;

use bytes::Bytes;
use credmux_common::ModelId;
use tokio_stream::Stream;

use crate::error::ProviderError;

/// A chat-completion or embedding call as handed down from the dispatcher.
/// `body` is the passthrough JSON payload (`messages`, `input`, sampling
/// params, ...); the core never parses it beyond the top-level `model` and
/// `stream` fields it already consumed to get here.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: ModelId,
    pub body: serde_json::Value,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub model: ModelId,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub body: serde_json::Value,
    pub usage: Option<ProviderUsage>,
}

/// A raw SSE byte stream, forwarded to the client verbatim by the
/// dispatcher and folded by the streaming aggregator for accounting.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

pub enum CompletionOutcome {
    Unary(ProviderResponse),
    Stream(ChunkStream),
}
