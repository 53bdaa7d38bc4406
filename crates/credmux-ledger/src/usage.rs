use serde::{Deserialize, Serialize};

/// Token usage observed for one completed (or partially streamed) request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}
