use std::sync::Arc;

use async_trait::async_trait;
use credmux_common::ModelId;
use futures_util::StreamExt;
use serde_json::json;

use crate::credential::Credential;
use crate::error::{ProviderError, ProviderResult, UpstreamFailure};
use crate::oauth::OAuthStore;
use crate::plugin::Provider;
use crate::request::{ChunkStream, CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderResponse, ProviderUsage};

/// An OAuth-refreshed plugin whose credential is a local token file rather
/// than a static API key (spec.md §4.D), grounded on the device-refresh
/// flow of `qwen_code_provider.py`: one hardcoded model family, a bearer
/// token read from the (possibly just-refreshed) credential file, and a
/// single forced-refresh retry on a 401.
pub struct OAuthPlugin {
    name: String,
    /// Static fallback used when the credential blob carries no endpoint of
    /// its own (spec.md §4.D "Endpoint discovery").
    default_endpoint: String,
    models: Vec<String>,
    http: wreq::Client,
    oauth: Arc<OAuthStore>,
}

impl OAuthPlugin {
    pub fn new(
        name: impl Into<String>,
        default_endpoint: impl Into<String>,
        models: Vec<String>,
        http: wreq::Client,
        oauth: Arc<OAuthStore>,
    ) -> Self {
        Self {
            name: name.into(),
            default_endpoint: default_endpoint.into(),
            models,
            http,
            oauth,
        }
    }

    async fn resolve_endpoint(&self, oauth_path: &std::path::Path) -> ProviderResult<String> {
        Ok(self
            .oauth
            .endpoint(oauth_path)
            .await?
            .unwrap_or_else(|| self.default_endpoint.clone()))
    }

    async fn post_json(
        &self,
        credential: &Credential,
        path: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<wreq::Response> {
        let oauth_path = credential
            .as_oauth_path()
            .ok_or(ProviderError::MissingCredentialField("oauth_file"))?;
        let base = self.resolve_endpoint(oauth_path).await?;

        let token = self.oauth.access_token(oauth_path).await?;
        let response = self
            .http
            .post(format!("{base}{path}"))
            .bearer_auth(&token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_err)?;

        if response.status().as_u16() == 401 {
            tracing::warn!(provider = %self.name, "oauth upstream returned 401, forcing refresh and retrying once");
            let token = self.oauth.force_refresh(oauth_path).await?;
            return self
                .http
                .post(format!("{base}{path}"))
                .bearer_auth(&token)
                .json(body)
                .send()
                .await
                .map_err(map_transport_err);
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for OAuthPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_custom_logic(&self) -> bool {
        true
    }

    async fn list_models(&self, _credential: &Credential) -> ProviderResult<Vec<ModelId>> {
        Ok(self
            .models
            .iter()
            .map(|model| ModelId::new(self.name.clone(), model.clone()))
            .collect())
    }

    async fn completion(
        &self,
        credential: &Credential,
        request: CompletionRequest,
    ) -> ProviderResult<CompletionOutcome> {
        credential
            .as_oauth_path()
            .ok_or(ProviderError::MissingCredentialField("oauth_file"))?;
        let mut body = request.body;
        body["model"] = json!(request.model.model());
        body["stream"] = json!(request.stream);

        let response = self.post_json(credential, "/v1/chat/completions", &body).await?;
        if !response.status().is_success() {
            return Err(ProviderError::Upstream(failure_from_response(response).await));
        }

        if request.stream {
            let stream = response.bytes_stream().map(|chunk| {
                chunk.map_err(|err| {
                    ProviderError::Upstream(UpstreamFailure {
                        status_code: None,
                        headers: Vec::new(),
                        body: None,
                        message: err.to_string(),
                        is_timeout: false,
                        is_transport: true,
                    })
                })
            });
            let stream: ChunkStream = Box::pin(stream);
            return Ok(CompletionOutcome::Stream(stream));
        }

        let json_body: serde_json::Value = response.json().await.map_err(map_transport_err)?;
        let usage = extract_usage(&json_body);
        Ok(CompletionOutcome::Unary(ProviderResponse {
            body: json_body,
            usage,
        }))
    }

    async fn embedding(
        &self,
        _credential: &Credential,
        _request: EmbeddingRequest,
    ) -> ProviderResult<ProviderResponse> {
        Err(ProviderError::Unsupported("this oauth provider does not support embeddings"))
    }

    async fn refresh(&self, credential: &Credential) -> ProviderResult<()> {
        let path = credential
            .as_oauth_path()
            .ok_or(ProviderError::MissingCredentialField("oauth_file"))?;
        self.oauth.force_refresh(path).await?;
        Ok(())
    }
}

fn extract_usage(body: &serde_json::Value) -> Option<ProviderUsage> {
    let usage = body.get("usage")?;
    Some(ProviderUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

async fn failure_from_response(response: wreq::Response) -> UpstreamFailure {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response.json::<serde_json::Value>().await.ok();
    let message = body
        .as_ref()
        .and_then(|b| b.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("upstream returned status {status}"));
    UpstreamFailure {
        status_code: Some(status),
        headers,
        body,
        message,
        is_timeout: false,
        is_transport: false,
    }
}

fn map_transport_err(err: wreq::Error) -> ProviderError {
    let is_timeout = err.is_timeout();
    ProviderError::Upstream(UpstreamFailure {
        status_code: None,
        headers: Vec::new(),
        body: None,
        message: err.to_string(),
        is_timeout,
        is_transport: !is_timeout,
    })
}
