use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use credmux_provider::{Credential, OAuthPlugin, OAuthStore, OpenAiCompatiblePlugin, Provider, ProviderRegistry};

/// `{ledger credential key -> plugin credential}`, grouped by provider tag,
/// the shape `ModelCache::start` and `Dispatcher::new` both expect (spec.md
/// §6 "the core accepts a `{ provider -> [credential] }` map").
pub type CredentialMap = HashMap<String, Vec<(String, Credential)>>;

pub struct Ingested {
    pub registry: ProviderRegistry,
    pub credentials: CredentialMap,
}

/// Scans `<PROVIDER>_API_KEY[_<n>]` and `<PROVIDER>_OAUTH_FILE[_<n>]`
/// environment variables (spec.md §6 "Environment input"), groups them by
/// provider, and builds one plugin per provider: an
/// [`OpenAiCompatiblePlugin`] for API-key providers (base URL from
/// `<PROVIDER>_BASE_URL`, static provider config per spec.md §4.D) or an
/// [`OAuthPlugin`] for OAuth-file providers (`<PROVIDER>_OAUTH_ENDPOINT`,
/// `<PROVIDER>_OAUTH_MODELS` comma-separated).
///
/// A provider whose credentials are present but whose required static
/// config is missing is skipped with a warning rather than failing startup
/// entirely — one misconfigured upstream should not take down the others.
pub fn ingest_from_env(http: wreq::Client, oauth: Arc<OAuthStore>) -> Ingested {
    let mut api_key_providers: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut oauth_providers: HashMap<String, Vec<(String, PathBuf)>> = HashMap::new();

    for (name, value) in std::env::vars() {
        if let Some(provider) = strip_indexed_suffix(&name, "_API_KEY") {
            api_key_providers.entry(provider).or_default().push((name, value));
        } else if let Some(provider) = strip_indexed_suffix(&name, "_OAUTH_FILE") {
            oauth_providers
                .entry(provider)
                .or_default()
                .push((name, PathBuf::from(value)));
        }
    }

    let mut registry = ProviderRegistry::new();
    let mut credentials: CredentialMap = HashMap::new();

    for (provider, keys) in api_key_providers {
        let provider_tag = provider.to_ascii_lowercase();
        let Ok(base_url) = std::env::var(format!("{provider}_BASE_URL")) else {
            tracing::warn!(provider = %provider_tag, "found api keys but no {provider}_BASE_URL, skipping");
            continue;
        };
        registry.register(Arc::new(OpenAiCompatiblePlugin::new(
            provider_tag.clone(),
            base_url,
            http.clone(),
        )));
        let entries = keys
            .into_iter()
            .map(|(env_name, key)| (env_name, Credential::ApiKey(key)))
            .collect();
        credentials.insert(provider_tag, entries);
    }

    for (provider, files) in oauth_providers {
        let provider_tag = provider.to_ascii_lowercase();
        let Ok(endpoint) = std::env::var(format!("{provider}_OAUTH_ENDPOINT")) else {
            tracing::warn!(provider = %provider_tag, "found oauth files but no {provider}_OAUTH_ENDPOINT, skipping");
            continue;
        };
        let models: Vec<String> = std::env::var(format!("{provider}_OAUTH_MODELS"))
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        if models.is_empty() {
            tracing::warn!(provider = %provider_tag, "found oauth files but no {provider}_OAUTH_MODELS, skipping");
            continue;
        }
        registry.register(Arc::new(OAuthPlugin::new(
            provider_tag.clone(),
            endpoint,
            models,
            http.clone(),
            oauth.clone(),
        )) as Arc<dyn Provider>);
        let entries = files
            .into_iter()
            .map(|(env_name, path)| (env_name, Credential::OAuthFile(path)))
            .collect();
        credentials.entry(provider_tag).or_default().extend(entries);
    }

    Ingested { registry, credentials }
}

/// Flattens the provider-grouped map into the ledger-credential-key ->
/// plugin-credential lookup [`credmux_dispatch::Dispatcher::new`] expects.
pub fn flatten(map: &CredentialMap) -> HashMap<String, Credential> {
    map.values()
        .flatten()
        .map(|(key, credential)| (key.clone(), credential.clone()))
        .collect()
}

/// Matches `<PREFIX><suffix>` or `<PREFIX><suffix>_<n>`, returning `PREFIX`
/// lowercased-at-use-site (kept upper here so callers can build sibling
/// variable names like `{prefix}_BASE_URL`).
fn strip_indexed_suffix(name: &str, suffix: &str) -> Option<String> {
    if let Some(prefix) = name.strip_suffix(suffix) {
        if prefix.is_empty() {
            return None;
        }
        return Some(prefix.to_string());
    }
    let (prefix, rest) = name.split_once(suffix)?;
    let rest = rest.strip_prefix('_')?;
    if prefix.is_empty() || rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(prefix.to_string())
}
