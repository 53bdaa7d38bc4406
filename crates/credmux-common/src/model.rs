use std::fmt;

use serde::{Deserialize, Serialize};

/// A provider tag, compared case-insensitively everywhere but stored and
/// displayed in its original case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTag(String);

impl ProviderTag {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for ProviderTag {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for ProviderTag {}

impl std::hash::Hash for ProviderTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderTag {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelIdError {
    #[error("model id {0:?} is missing a provider/ prefix")]
    MissingProvider(String),
}

/// A `provider/model-id` qualified name. This is the only model identifier
/// that crosses component boundaries; raw (unqualified) model ids never do.
///
/// `provider` is normalized to lowercase at construction so every downstream
/// `HashMap`/`&str` lookup keyed on it (model cache, provider registry,
/// cooldown controller) is case-insensitive for free, matching spec.md:29's
/// "grouped by provider (case-insensitive name)" without needing to route
/// every lookup through `ProviderTag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId {
    provider: String,
    model: String,
}

impl ModelId {
    pub fn parse(qualified: &str) -> Result<Self, ModelIdError> {
        match qualified.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_ascii_lowercase(),
                model: model.to_string(),
            }),
            _ => Err(ModelIdError::MissingProvider(qualified.to_string())),
        }
    }

    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into().to_ascii_lowercase(),
            model: model.into(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl TryFrom<String> for ModelId {
    type Error = ModelIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModelId> for String {
    fn from(value: ModelId) -> Self {
        value.qualified()
    }
}
