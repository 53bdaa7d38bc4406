use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use credmux_classify::{classify, ClassifiedError, ErrorKind, RawFailure};
use credmux_common::{ModelId, ProviderTag};
use credmux_ledger::{cooldown_seconds, CooldownController, UsageLedger};
use credmux_modelcache::ModelCache;
use credmux_provider::{
    Credential, CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderError, ProviderRegistry,
    ProviderResponse, ProviderUsage,
};
use futures_util::StreamExt;
use tokio::time::Instant;

use crate::aggregator::Aggregator;
use crate::error::DispatchError;
use crate::request::{DispatchChunkStream, DispatchEmbeddingRequest, DispatchOutcome, DispatchRequest};
use crate::sse::{is_done_sentinel, SseParser};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cap on retries for `ErrorKind::Unknown` failures (spec.md §6
    /// `max_attempts_unknown`); every other kind is bounded only by the
    /// deadline and the shrinking candidate set.
    pub max_attempts_unknown: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_attempts_unknown: 3 }
    }
}

/// The rotating dispatcher (spec.md §4.F): the retry/acquire/release loop
/// that turns a client request into either a unary response or a forwarded
/// chunk stream, recording outcomes into the ledger and provider cooldown
/// controller as it goes.
pub struct Dispatcher {
    ledger: Arc<UsageLedger>,
    cooldowns: Arc<CooldownController>,
    modelcache: Arc<ModelCache>,
    registry: Arc<ProviderRegistry>,
    /// ledger credential key -> plugin-facing credential value.
    credentials: HashMap<String, Credential>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<UsageLedger>,
        cooldowns: Arc<CooldownController>,
        modelcache: Arc<ModelCache>,
        registry: Arc<ProviderRegistry>,
        credentials: HashMap<String, Credential>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            cooldowns,
            modelcache,
            registry,
            credentials,
            config,
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest, deadline: Instant) -> Result<DispatchOutcome, DispatchError> {
        let provider_name = request.model.provider().to_string();
        let mut candidates = self.modelcache.candidates(&request.model).await;
        if candidates.is_empty() {
            return Err(DispatchError::ModelUnavailable(request.model.qualified()));
        }

        let Some(plugin) = self.registry.get(&provider_name) else {
            return Err(DispatchError::ModelUnavailable(request.model.qualified()));
        };

        let mut last_failure: Option<ClassifiedError> = None;
        let mut unknown_attempts: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(exhausted(last_failure));
            }

            if self.cooldowns.is_cooling(&provider_name).await {
                let remaining = self.cooldowns.remaining(&provider_name).await.max(0) as u64;
                let wake_at = (Instant::now() + Duration::from_secs(remaining)).min(deadline);
                tokio::time::sleep_until(wake_at).await;
                if Instant::now() >= deadline {
                    return Err(DispatchError::ProviderCooling(provider_name));
                }
                continue;
            }

            if candidates.is_empty() {
                return Err(exhausted(last_failure));
            }

            let lease = match self.ledger.acquire(&candidates, &request.model, deadline).await {
                Ok(lease) => lease,
                Err(_) => return Err(exhausted(last_failure)),
            };
            let credential_key = lease.credential().to_string();

            let Some(credential) = self.credentials.get(&credential_key).cloned() else {
                tracing::warn!(credential = %credential_key, "ledger chose a credential with no plugin binding");
                lease.release().await;
                candidates.retain(|c| c != &credential_key);
                continue;
            };

            let completion_request = CompletionRequest {
                model: request.model.clone(),
                body: request.body.clone(),
                stream: request.stream,
            };

            match plugin.completion(&credential, completion_request).await {
                Ok(CompletionOutcome::Unary(response)) => {
                    let usage = response.usage.clone().map(to_usage_summary);
                    self.ledger.record_success(&credential_key, &request.model, usage).await;
                    lease.release().await;
                    return Ok(DispatchOutcome::Unary(response));
                }
                Ok(CompletionOutcome::Stream(mut inner)) => match inner.next().await {
                    None => {
                        self.ledger.record_success(&credential_key, &request.model, None).await;
                        lease.release().await;
                        let empty = futures_util::stream::empty::<Result<bytes::Bytes, DispatchError>>();
                        return Ok(DispatchOutcome::Stream(Box::pin(empty)));
                    }
                    Some(Ok(first_chunk)) => {
                        let stream = stream_session(
                            self.ledger.clone(),
                            self.cooldowns.clone(),
                            credential_key,
                            request.model.clone(),
                            lease,
                            first_chunk,
                            inner,
                        );
                        return Ok(DispatchOutcome::Stream(stream));
                    }
                    Some(Err(provider_err)) => {
                        let classified = classify_provider_error(&request.model, &credential_key, &provider_err);
                        lease.release().await;
                        self.ledger.record_failure(&credential_key, &request.model, &classified).await;
                        match self
                            .after_failure(&provider_name, &mut candidates, &credential_key, &classified, &mut unknown_attempts)
                            .await
                        {
                            Some(terminal) => return Err(terminal),
                            None => {
                                last_failure = Some(classified);
                                continue;
                            }
                        }
                    }
                },
                Err(provider_err) => {
                    let classified = classify_provider_error(&request.model, &credential_key, &provider_err);
                    lease.release().await;
                    self.ledger.record_failure(&credential_key, &request.model, &classified).await;
                    match self
                        .after_failure(&provider_name, &mut candidates, &credential_key, &classified, &mut unknown_attempts)
                        .await
                    {
                        Some(terminal) => return Err(terminal),
                        None => {
                            last_failure = Some(classified);
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Same retry/acquire/release loop as [`Dispatcher::dispatch`], but for
    /// embedding calls, which are always unary (spec.md §4.D capability set
    /// lists `embedding(credential, request) -> response` with no streaming
    /// variant).
    pub async fn dispatch_embedding(
        &self,
        request: DispatchEmbeddingRequest,
        deadline: Instant,
    ) -> Result<ProviderResponse, DispatchError> {
        let provider_name = request.model.provider().to_string();
        let mut candidates = self.modelcache.candidates(&request.model).await;
        if candidates.is_empty() {
            return Err(DispatchError::ModelUnavailable(request.model.qualified()));
        }

        let Some(plugin) = self.registry.get(&provider_name) else {
            return Err(DispatchError::ModelUnavailable(request.model.qualified()));
        };

        let mut last_failure: Option<ClassifiedError> = None;
        let mut unknown_attempts: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(exhausted(last_failure));
            }

            if self.cooldowns.is_cooling(&provider_name).await {
                let remaining = self.cooldowns.remaining(&provider_name).await.max(0) as u64;
                let wake_at = (Instant::now() + Duration::from_secs(remaining)).min(deadline);
                tokio::time::sleep_until(wake_at).await;
                if Instant::now() >= deadline {
                    return Err(DispatchError::ProviderCooling(provider_name));
                }
                continue;
            }

            if candidates.is_empty() {
                return Err(exhausted(last_failure));
            }

            let lease = match self.ledger.acquire(&candidates, &request.model, deadline).await {
                Ok(lease) => lease,
                Err(_) => return Err(exhausted(last_failure)),
            };
            let credential_key = lease.credential().to_string();

            let Some(credential) = self.credentials.get(&credential_key).cloned() else {
                tracing::warn!(credential = %credential_key, "ledger chose a credential with no plugin binding");
                lease.release().await;
                candidates.retain(|c| c != &credential_key);
                continue;
            };

            let embedding_request = EmbeddingRequest {
                model: request.model.clone(),
                body: request.body.clone(),
            };

            match plugin.embedding(&credential, embedding_request).await {
                Ok(response) => {
                    let usage = response.usage.clone().map(to_usage_summary);
                    self.ledger.record_success(&credential_key, &request.model, usage).await;
                    lease.release().await;
                    return Ok(response);
                }
                Err(provider_err) => {
                    let classified = classify_provider_error(&request.model, &credential_key, &provider_err);
                    lease.release().await;
                    self.ledger.record_failure(&credential_key, &request.model, &classified).await;
                    match self
                        .after_failure(&provider_name, &mut candidates, &credential_key, &classified, &mut unknown_attempts)
                        .await
                    {
                        Some(terminal) => return Err(terminal),
                        None => {
                            last_failure = Some(classified);
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Applies spec.md §4.F step (e) after a lease has already been released
    /// and the failure recorded. Returns `Some(terminal)` when the dispatcher
    /// must stop retrying and surface an error immediately.
    async fn after_failure(
        &self,
        provider_name: &str,
        candidates: &mut Vec<String>,
        credential_key: &str,
        classified: &ClassifiedError,
        unknown_attempts: &mut u32,
    ) -> Option<DispatchError> {
        if classified.kind.is_terminal() {
            return Some(DispatchError::Rejected {
                kind: classified.kind,
                cause: classified.cause.clone(),
            });
        }

        if classified.kind == ErrorKind::RateLimit && classified.provider_wide {
            let seconds = cooldown_seconds(classified.kind, 1, classified.retry_after_seconds);
            self.cooldowns.start(provider_name, seconds).await;
        }

        if classified.kind == ErrorKind::Unknown {
            *unknown_attempts += 1;
            if *unknown_attempts > self.config.max_attempts_unknown {
                return Some(DispatchError::Exhausted {
                    kind: Some(classified.kind),
                    cause: Some(classified.cause.clone()),
                });
            }
        }

        candidates.retain(|c| c != credential_key);
        None
    }
}

fn exhausted(last_failure: Option<ClassifiedError>) -> DispatchError {
    match last_failure {
        Some(classified) => DispatchError::Exhausted {
            kind: Some(classified.kind),
            cause: Some(classified.cause),
        },
        None => DispatchError::Exhausted { kind: None, cause: None },
    }
}

fn to_usage_summary(usage: ProviderUsage) -> credmux_ledger::UsageSummary {
    credmux_ledger::UsageSummary {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
}

fn classify_provider_error(model: &ModelId, credential: &str, err: &ProviderError) -> ClassifiedError {
    let provider = ProviderTag::new(model.provider());
    match err {
        ProviderError::Upstream(failure) => {
            let raw = RawFailure {
                status_code: failure.status_code,
                headers: &failure.headers,
                body: failure.body.as_ref(),
                message: Some(failure.message.as_str()),
                is_timeout: failure.is_timeout,
                is_transport: failure.is_transport,
            };
            classify(provider, model.clone(), credential.to_string(), raw, failure.message.clone())
        }
        other => ClassifiedError {
            kind: ErrorKind::Unknown,
            retry_after_seconds: None,
            status_code: None,
            provider,
            model: model.clone(),
            credential: credential.to_string(),
            cause: other.to_string(),
            provider_wide: false,
        },
    }
}

/// Builds the forwarded chunk stream for an already-committed streaming
/// call. The first chunk has left the provider adapter and cannot be
/// un-sent, so every failure observed from here on is terminal for this
/// request (spec.md §4.F "Streaming special case") — it ends the stream
/// with an error frame instead of retrying.
fn stream_session(
    ledger: Arc<UsageLedger>,
    cooldowns: Arc<CooldownController>,
    credential_key: String,
    model: ModelId,
    lease: credmux_ledger::Lease,
    first_chunk: bytes::Bytes,
    mut inner: credmux_provider::ChunkStream,
) -> DispatchChunkStream {
    let provider_name = model.provider().to_string();
    let stream = async_stream::stream! {
        let mut aggregator = Aggregator::new();
        let mut parser = SseParser::new();
        fold_sse_bytes(&mut parser, &mut aggregator, &first_chunk);
        yield Ok(first_chunk);

        let mut failure: Option<ClassifiedError> = None;
        loop {
            match inner.next().await {
                None => break,
                Some(Ok(bytes)) => {
                    fold_sse_bytes(&mut parser, &mut aggregator, &bytes);
                    yield Ok(bytes);
                }
                Some(Err(provider_err)) => {
                    let classified = classify_provider_error(&model, &credential_key, &provider_err);
                    let kind = classified.kind;
                    let cause = classified.cause.clone();
                    if classified.kind == ErrorKind::RateLimit && classified.provider_wide {
                        let seconds = cooldown_seconds(classified.kind, 1, classified.retry_after_seconds);
                        cooldowns.start(&provider_name, seconds).await;
                    }
                    failure = Some(classified);
                    yield Err(DispatchError::Rejected { kind, cause });
                    break;
                }
            }
        }

        match &failure {
            Some(classified) => ledger.record_failure(&credential_key, &model, classified).await,
            None => {
                let usage = aggregator.usage().map(to_usage_summary);
                ledger.record_success(&credential_key, &model, usage).await;
            }
        }
        lease.release().await;
    };
    Box::pin(stream)
}

fn fold_sse_bytes(parser: &mut SseParser, aggregator: &mut Aggregator, chunk: &bytes::Bytes) {
    for event in parser.push_bytes(chunk) {
        if is_done_sentinel(&event) {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&event.data) {
            aggregator.fold_chunk(&value);
        }
    }
}
