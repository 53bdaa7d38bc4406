use std::pin::Pin;

use bytes::Bytes;
use credmux_common::ModelId;
use credmux_provider::ProviderResponse;
use tokio_stream::Stream;

use crate::error::DispatchError;

/// A client request already parsed down to the fields the rotation core
/// needs (spec.md §6 "Inbound HTTP surface ... invoked with a request
/// already parsed"). The front-end collaborator owns everything else.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub model: ModelId,
    pub stream: bool,
    pub body: serde_json::Value,
}

/// An embedding call — always unary, so it carries no `stream` flag.
#[derive(Debug, Clone)]
pub struct DispatchEmbeddingRequest {
    pub model: ModelId,
    pub body: serde_json::Value,
}

/// Byte stream handed back to the front-end collaborator for SSE
/// serialization. Chunks are forwarded verbatim; a terminating `Err` means
/// the stream must be closed with an error frame (spec.md §4.F "Streaming
/// special case").
pub type DispatchChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, DispatchError>> + Send>>;

pub enum DispatchOutcome {
    Unary(ProviderResponse),
    Stream(DispatchChunkStream),
}
