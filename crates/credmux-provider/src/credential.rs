use std::path::PathBuf;

/// A credential as handed to a provider plugin. The core never interprets
/// either variant: an API key is an opaque bearer string, a file path is
/// opaque except to the plugin that owns the OAuth profile stored there.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(String),
    OAuthFile(PathBuf),
}

impl Credential {
    pub fn as_api_key(&self) -> Option<&str> {
        match self {
            Credential::ApiKey(key) => Some(key),
            Credential::OAuthFile(_) => None,
        }
    }

    pub fn as_oauth_path(&self) -> Option<&std::path::Path> {
        match self {
            Credential::OAuthFile(path) => Some(path),
            Credential::ApiKey(_) => None,
        }
    }
}
