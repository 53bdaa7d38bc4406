use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use credmux_common::{Clock, FixedClock, ModelId};
use credmux_dispatch::{DispatchError, DispatchOutcome, DispatchRequest, Dispatcher, DispatcherConfig};
use credmux_ledger::{CooldownController, LedgerConfig, UsageLedger};
use credmux_modelcache::{ModelCache, ModelCacheConfig};
use credmux_provider::{
    ChunkStream, Credential, CompletionOutcome, CompletionRequest, EmbeddingRequest, ProviderError,
    ProviderRegistry, ProviderResponse, ProviderResult, UpstreamFailure,
};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

enum Script {
    Success(ProviderResponse),
    Failure(ProviderError),
    Stream(Vec<Result<Bytes, ProviderError>>),
}

struct ScriptedProvider {
    name: &'static str,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
}

impl ScriptedProvider {
    fn new(name: &'static str, scripts: HashMap<String, VecDeque<Script>>) -> Self {
        Self {
            name,
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl credmux_provider::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn list_models(&self, _credential: &Credential) -> ProviderResult<Vec<ModelId>> {
        Ok(vec![ModelId::new(self.name, "m")])
    }

    async fn completion(&self, credential: &Credential, _request: CompletionRequest) -> ProviderResult<CompletionOutcome> {
        let key = credential.as_api_key().expect("test credentials are api keys").to_string();
        let mut scripts = self.scripts.lock().await;
        let queue = scripts.get_mut(&key).expect("no script registered for credential");
        match queue.pop_front().expect("script exhausted for credential") {
            Script::Success(response) => Ok(CompletionOutcome::Unary(response)),
            Script::Failure(err) => Err(err),
            Script::Stream(chunks) => {
                let stream = tokio_stream::iter(chunks);
                let stream: ChunkStream = Box::pin(stream);
                Ok(CompletionOutcome::Stream(stream))
            }
        }
    }

    async fn embedding(&self, credential: &Credential, _request: EmbeddingRequest) -> ProviderResult<ProviderResponse> {
        let key = credential.as_api_key().expect("test credentials are api keys").to_string();
        let mut scripts = self.scripts.lock().await;
        let queue = scripts.get_mut(&key).expect("no script registered for credential");
        match queue.pop_front().expect("script exhausted for credential") {
            Script::Success(response) => Ok(response),
            Script::Failure(err) => Err(err),
            Script::Stream(_) => panic!("embedding scenarios never script a stream"),
        }
    }
}

fn model() -> ModelId {
    ModelId::new("p", "m")
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn rate_limited(retry_after: &str, provider_wide: bool) -> ProviderError {
    let mut headers = vec![("retry-after".to_string(), retry_after.to_string())];
    if provider_wide {
        headers.push(("x-ratelimit-scope".to_string(), "ip".to_string()));
    }
    ProviderError::Upstream(UpstreamFailure {
        status_code: Some(429),
        headers,
        body: None,
        message: "rate limited".to_string(),
        is_timeout: false,
        is_transport: false,
    })
}

fn unauthorized() -> ProviderError {
    ProviderError::Upstream(UpstreamFailure {
        status_code: Some(401),
        headers: Vec::new(),
        body: None,
        message: "invalid api key".to_string(),
        is_timeout: false,
        is_transport: false,
    })
}

fn server_error() -> ProviderError {
    ProviderError::Upstream(UpstreamFailure {
        status_code: Some(500),
        headers: Vec::new(),
        body: None,
        message: "internal error".to_string(),
        is_timeout: false,
        is_transport: false,
    })
}

fn ok_response() -> ProviderResponse {
    ProviderResponse {
        body: serde_json::json!({"ok": true}),
        usage: None,
    }
}

async fn build(
    scripts: HashMap<String, VecDeque<Script>>,
) -> (Dispatcher, Arc<UsageLedger>, Arc<CooldownController>, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::new(1_700_000_000));
    let ledger = UsageLedger::load(clock.clone(), LedgerConfig::default()).await;
    let cooldowns = Arc::new(CooldownController::new(clock.clone()));
    let dispatcher = build_with(ledger.clone(), cooldowns.clone(), &["k1", "k2"], scripts).await;
    (dispatcher, ledger, cooldowns, clock)
}

/// Builds a dispatcher over exactly `keys`, sharing the given ledger and
/// cooldown controller so multiple dispatchers can be exercised against the
/// same shared state (used to test provider-cooldown coalescing across
/// concurrent, independently-credentialed dispatches).
async fn build_with(
    ledger: Arc<UsageLedger>,
    cooldowns: Arc<CooldownController>,
    keys: &[&str],
    scripts: HashMap<String, VecDeque<Script>>,
) -> Dispatcher {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(ScriptedProvider::new("p", scripts)));
    let registry = Arc::new(registry);

    let mut credentials = HashMap::new();
    let mut pairs = Vec::new();
    for key in keys {
        credentials.insert(key.to_string(), Credential::ApiKey(key.to_string()));
        pairs.push((key.to_string(), Credential::ApiKey(key.to_string())));
    }
    let mut provider_credentials = HashMap::new();
    provider_credentials.insert("p".to_string(), pairs);

    let modelcache = ModelCache::start(
        registry.clone(),
        provider_credentials,
        ModelCacheConfig {
            refresh_interval: Duration::from_secs(3600),
        },
    )
    .await;

    Dispatcher::new(ledger, cooldowns, modelcache, registry, credentials, DispatcherConfig::default())
}

fn request() -> DispatchRequest {
    DispatchRequest {
        model: model(),
        stream: false,
        body: serde_json::json!({"messages": []}),
    }
}

#[tokio::test]
async fn rotation_on_429_succeeds_from_second_credential() {
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), VecDeque::from([Script::Failure(rate_limited("30", false))]));
    scripts.insert("k2".to_string(), VecDeque::from([Script::Success(ok_response())]));
    let (dispatcher, ledger, _cooldowns, _clock) = build(scripts).await;

    let outcome = dispatcher.dispatch(request(), far_deadline()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unary(_)));

    let snapshot = ledger.snapshot().await;
    let k1 = snapshot.get("k1").unwrap();
    let end = *k1.model_cooldowns.get(&model().qualified()).unwrap();
    assert!((1_700_000_027..=1_700_000_033).contains(&end), "end={end}");
    assert_eq!(k1.failures.get(&model().qualified()).unwrap().consecutive_failures, 1);

    let k2 = snapshot.get("k2").unwrap();
    assert_eq!(k2.global.get(&model().qualified()).unwrap().success_count, 1);
}

#[tokio::test]
async fn auth_failure_is_retried_on_a_different_credential_and_disables_the_first() {
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), VecDeque::from([Script::Failure(unauthorized())]));
    scripts.insert("k2".to_string(), VecDeque::from([Script::Success(ok_response())]));
    let (dispatcher, ledger, _cooldowns, clock) = build(scripts).await;

    let outcome = dispatcher.dispatch(request(), far_deadline()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Unary(_)));

    let snapshot = ledger.snapshot().await;
    let k1 = snapshot.get("k1").unwrap();
    assert_eq!(k1.disabled_until, Some(clock.now_unix() + 86_400));

    let k2 = snapshot.get("k2").unwrap();
    assert_eq!(k2.global.get(&model().qualified()).unwrap().success_count, 1);
}

#[tokio::test]
async fn terminal_failures_are_not_retried() {
    let bad_request = ProviderError::Upstream(UpstreamFailure {
        status_code: Some(400),
        headers: Vec::new(),
        body: None,
        message: "missing field".to_string(),
        is_timeout: false,
        is_transport: false,
    });
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), VecDeque::from([Script::Failure(bad_request)]));
    scripts.insert("k2".to_string(), VecDeque::from([Script::Success(ok_response())]));
    let (dispatcher, _ledger, _cooldowns, _clock) = build(scripts).await;

    let err = dispatcher.dispatch(request(), far_deadline()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Rejected { kind: credmux_classify::ErrorKind::BadRequest, .. }));
}

#[tokio::test]
async fn deadline_exhaustion_surfaces_the_last_classified_failure() {
    let mut k1_script = VecDeque::new();
    for _ in 0..4 {
        k1_script.push_back(Script::Failure(server_error()));
    }
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), k1_script);
    scripts.insert("k2".to_string(), VecDeque::from([Script::Failure(server_error())]));
    let (dispatcher, ledger, _cooldowns, _clock) = build(scripts).await;

    let deadline = Instant::now() + Duration::from_millis(50);
    let err = dispatcher.dispatch(request(), deadline).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Exhausted { kind: Some(credmux_classify::ErrorKind::ServerError), .. }
    ));

    let snapshot = ledger.snapshot().await;
    assert!(snapshot.get("k1").unwrap().failures.get(&model().qualified()).unwrap().consecutive_failures >= 1);
}

#[tokio::test]
async fn streaming_aggregation_forwards_chunks_and_records_usage() {
    let chunks = vec![
        Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n")),
        Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n")),
        Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
        )),
        Ok(Bytes::from_static(
            b"data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4}}\n\n",
        )),
        Ok(Bytes::from_static(b"data: [DONE]\n\n")),
    ];
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), VecDeque::from([Script::Stream(chunks)]));
    scripts.insert("k2".to_string(), VecDeque::new());
    let (dispatcher, ledger, _cooldowns, _clock) = build(scripts).await;

    let mut streaming_request = request();
    streaming_request.stream = true;
    let outcome = dispatcher.dispatch(streaming_request, far_deadline()).await.unwrap();
    let DispatchOutcome::Stream(stream) = outcome else {
        panic!("expected a streaming outcome");
    };

    let forwarded: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(forwarded.len(), 5);

    let snapshot = ledger.snapshot().await;
    let counters = snapshot.get("k1").unwrap().global.get(&model().qualified()).unwrap();
    assert_eq!(counters.prompt_tokens, 3);
    assert_eq!(counters.completion_tokens, 4);
    assert_eq!(counters.success_count, 1);
}

#[tokio::test]
async fn concurrent_provider_wide_rate_limits_coalesce_to_the_larger_cooldown() {
    let clock = Arc::new(FixedClock::new(1_700_000_000));
    let ledger = UsageLedger::load(clock.clone(), LedgerConfig::default()).await;
    let cooldowns = Arc::new(CooldownController::new(clock.clone()));

    let mut k1_only = HashMap::new();
    k1_only.insert("k1".to_string(), VecDeque::from([Script::Failure(rate_limited("30", true))]));
    let k1_dispatcher = build_with(ledger.clone(), cooldowns.clone(), &["k1"], k1_only).await;

    let mut k2_only = HashMap::new();
    k2_only.insert("k2".to_string(), VecDeque::from([Script::Failure(rate_limited("90", true))]));
    let k2_dispatcher = build_with(ledger.clone(), cooldowns.clone(), &["k2"], k2_only).await;

    let deadline = short_deadline();
    let (first, second) = tokio::join!(
        k1_dispatcher.dispatch(request(), deadline),
        k2_dispatcher.dispatch(request(), deadline),
    );
    assert!(first.is_err());
    assert!(second.is_err());

    assert!(cooldowns.is_cooling("p").await);
    let remaining = cooldowns.remaining("p").await;
    assert!(remaining >= 81, "remaining={remaining}");
}

fn short_deadline() -> Instant {
    Instant::now() + Duration::from_millis(200)
}

#[tokio::test]
async fn embedding_rotation_on_failure_succeeds_from_second_credential() {
    let mut scripts = HashMap::new();
    scripts.insert("k1".to_string(), VecDeque::from([Script::Failure(server_error())]));
    scripts.insert("k2".to_string(), VecDeque::from([Script::Success(ok_response())]));
    let (dispatcher, ledger, _cooldowns, _clock) = build(scripts).await;

    let request = credmux_dispatch::DispatchEmbeddingRequest {
        model: model(),
        body: serde_json::json!({"input": "hello"}),
    };
    let response = dispatcher.dispatch_embedding(request, far_deadline()).await.unwrap();
    assert_eq!(response.body, ok_response().body);

    let snapshot = ledger.snapshot().await;
    assert_eq!(snapshot.get("k2").unwrap().global.get(&model().qualified()).unwrap().success_count, 1);
    assert_eq!(
        snapshot.get("k1").unwrap().failures.get(&model().qualified()).unwrap().consecutive_failures,
        1
    );
}
