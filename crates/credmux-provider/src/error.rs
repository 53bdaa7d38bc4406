use std::fmt;

/// An upstream HTTP failure reduced to the fields the error classifier
/// needs, without the provider having to depend on `credmux-classify`
/// itself. Mirrors the shape of a raw HTTP response/transport failure.
#[derive(Debug, Clone)]
pub struct UpstreamFailure {
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub message: String,
    pub is_timeout: bool,
    pub is_transport: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("invalid provider config: {0}")]
    InvalidConfig(String),
    #[error("missing credential field: {0}")]
    MissingCredentialField(&'static str),
    #[error("oauth refresh failed: {0}")]
    OAuthRefreshFailed(String),
    #[error("upstream call failed: {0}")]
    Upstream(UpstreamFailure),
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "status {code}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
