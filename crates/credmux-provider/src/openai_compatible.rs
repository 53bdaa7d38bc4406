use async_trait::async_trait;
use credmux_common::ModelId;
use futures_util::StreamExt;
use serde_json::json;

use crate::credential::Credential;
use crate::error::{ProviderError, ProviderResult, UpstreamFailure};
use crate::plugin::Provider;
use crate::request::{ChunkStream, CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderResponse, ProviderUsage};

/// A plugin for any upstream that already speaks the OpenAI chat-completion
/// and embedding wire protocol (spec.md §6 "the plugin may delegate to a
/// shared HTTP translator"). Credential is a bearer API key.
pub struct OpenAiCompatiblePlugin {
    name: String,
    base_url: String,
    http: wreq::Client,
}

impl OpenAiCompatiblePlugin {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http: wreq::Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn bearer<'a>(&self, credential: &'a Credential) -> ProviderResult<&'a str> {
        credential
            .as_api_key()
            .ok_or(ProviderError::MissingCredentialField("api_key"))
    }
}

#[async_trait]
impl Provider for OpenAiCompatiblePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self, credential: &Credential) -> ProviderResult<Vec<ModelId>> {
        let key = self.bearer(credential)?;
        let response = self
            .http
            .get(self.url("/v1/models"))
            .bearer_auth(key)
            .send()
            .await
            .map_err(map_transport_err)?;

        if !response.status().is_success() {
            return Err(ProviderError::Upstream(failure_from_response(response).await));
        }

        let body: serde_json::Value = response.json().await.map_err(map_transport_err)?;
        let models = body
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(models
            .into_iter()
            .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .map(|model_id| ModelId::new(self.name.clone(), model_id))
            .collect())
    }

    async fn completion(
        &self,
        credential: &Credential,
        request: CompletionRequest,
    ) -> ProviderResult<CompletionOutcome> {
        let key = self.bearer(credential)?;
        let mut body = request.body;
        body["model"] = json!(request.model.model());
        body["stream"] = json!(request.stream);

        let response = self
            .http
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_err)?;

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
        credential: &Credential,
        request: EmbeddingRequest,
    ) -> ProviderResult<ProviderResponse> {
        let key = self.bearer(credential)?;
        let mut body = request.body;
        body["model"] = json!(request.model.model());

        let response = self
            .http
            .post(self.url("/v1/embeddings"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_err)?;

        if !response.status().is_success() {
            return Err(ProviderError::Upstream(failure_from_response(response).await));
        }

        let json_body: serde_json::Value = response.json().await.map_err(map_transport_err)?;
        let usage = extract_usage(&json_body);
        Ok(ProviderResponse {
            body: json_body,
            usage,
        })
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
