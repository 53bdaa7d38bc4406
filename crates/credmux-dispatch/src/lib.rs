//! The rotating dispatcher and streaming aggregator (spec.md §4.F, §4.G):
//! the retry/acquire/release loop that turns a parsed client request into a
//! unary response or a forwarded chunk stream, folding streamed chunks into
//! a shadow response for accounting along the way.

mod aggregator;
mod dispatcher;
mod error;
mod request;
mod sse;

pub use aggregator::Aggregator;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::DispatchError;
pub use request::{DispatchChunkStream, DispatchEmbeddingRequest, DispatchOutcome, DispatchRequest};
pub use sse::{SseEvent, SseParser};
