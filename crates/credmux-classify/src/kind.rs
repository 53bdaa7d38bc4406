use credmux_common::{ModelId, ProviderTag};
use serde::{Deserialize, Serialize};

/// The closed failure taxonomy every upstream error is reduced to before it
/// reaches the ledger or the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    BadRequest,
    ContextWindow,
    ServerError,
    Timeout,
    Transport,
    Unknown,
}

impl ErrorKind {
    /// `true` for kinds the dispatcher should never retry for the same
    /// inputs, even against a different credential.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::BadRequest | ErrorKind::ContextWindow)
    }

    /// `true` for kinds that penalize only the offending credential, not
    /// the whole provider.
    pub fn is_credential_scoped(self) -> bool {
        !matches!(self, ErrorKind::BadRequest | ErrorKind::ContextWindow)
    }
}

/// An upstream failure reduced to the closed taxonomy, carrying enough
/// context for the ledger to record it and the dispatcher to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retry_after_seconds: Option<u64>,
    pub status_code: Option<u16>,
    pub provider: ProviderTag,
    pub model: ModelId,
    pub credential: String,
    pub cause: String,
    /// `true` when the rate-limit signal looks IP- or provider-scoped
    /// rather than tied to the offending credential (spec.md §4.F: "the
    /// hint is provider-wide"). Only meaningful for `ErrorKind::RateLimit`.
    pub provider_wide: bool,
}
