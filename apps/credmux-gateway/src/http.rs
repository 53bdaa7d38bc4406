use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use credmux_classify::ErrorKind;
use credmux_common::ModelId;
use credmux_dispatch::{DispatchEmbeddingRequest, DispatchError, DispatchOutcome, DispatchRequest, Dispatcher};
use tokio::time::Instant;

use crate::archiver::{Transaction, TransactionArchiver, TransactionOutcome};

/// Shared state for both HTTP handlers (spec.md §6 "Inbound HTTP"). Request
/// parsing and deadline resolution happen here, outside the core's test
/// surface; everything past `DispatchRequest` is the dispatcher's job.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub archiver: Arc<dyn TransactionArchiver>,
    pub request_deadline: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .with_state(state)
}

async fn chat_completions(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();

    let model = match parse_model(&body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let deadline = Instant::now() + state.request_deadline;
    let request = DispatchRequest {
        model: model.clone(),
        stream,
        body,
    };

    match state.dispatcher.dispatch(request, deadline).await {
        Ok(DispatchOutcome::Unary(response)) => {
            let (prompt_tokens, completion_tokens) = response
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));
            archive(&state, &request_id, &model, stream, started, TransactionOutcome::Success {
                prompt_tokens,
                completion_tokens,
            })
            .await;
            Json(response.body).into_response()
        }
        // Token accounting for a streamed call happens inside the dispatcher
        // as chunks fold into the ledger; the gateway has nothing further to
        // archive once it hands the byte stream to the client.
        Ok(DispatchOutcome::Stream(chunks)) => sse_response(chunks),
        Err(err) => {
            archive(&state, &request_id, &model, stream, started, failure_outcome(&err)).await;
            error_response(err)
        }
    }
}

async fn embeddings(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();

    let model = match parse_model(&body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let deadline = Instant::now() + state.request_deadline;
    let request = DispatchEmbeddingRequest {
        model: model.clone(),
        body,
    };

    match state.dispatcher.dispatch_embedding(request, deadline).await {
        Ok(response) => {
            let (prompt_tokens, completion_tokens) = response
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));
            archive(&state, &request_id, &model, false, started, TransactionOutcome::Success {
                prompt_tokens,
                completion_tokens,
            })
            .await;
            Json(response.body).into_response()
        }
        Err(err) => {
            archive(&state, &request_id, &model, false, started, failure_outcome(&err)).await;
            error_response(err)
        }
    }
}

fn sse_response(chunks: credmux_dispatch::DispatchChunkStream) -> Response {
    let body = Body::from_stream(chunks);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("static headers are always valid")
}

fn parse_model(body: &serde_json::Value) -> Result<ModelId, Response> {
    let raw = body.get("model").and_then(|v| v.as_str());
    let Some(raw) = raw else {
        return Err(bad_request_response("request body must include a \"model\" field"));
    };
    ModelId::parse(raw).map_err(|err| bad_request_response(&err.to_string()))
}

fn bad_request_response(message: &str) -> Response {
    let body = serde_json::json!({"error": {"message": message, "type": "invalid_request_error"}});
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Maps the dispatcher's terminal errors to status codes (spec.md §7,
/// SPEC_FULL.md §7): `model_unavailable`/`provider_cooling`/`exhausted` are
/// all 503 (the client should retry later against the same gateway),
/// `bad_request`/`context_window` reflect the client's own mistake.
fn error_response(err: DispatchError) -> Response {
    let (status, kind) = match &err {
        DispatchError::ModelUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable"),
        DispatchError::ProviderCooling(_) => (StatusCode::SERVICE_UNAVAILABLE, "provider_cooling"),
        DispatchError::Exhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "exhausted"),
        DispatchError::Rejected { kind: ErrorKind::BadRequest, .. } => (StatusCode::BAD_REQUEST, "bad_request"),
        DispatchError::Rejected { kind: ErrorKind::ContextWindow, .. } => {
            (StatusCode::PAYLOAD_TOO_LARGE, "context_window")
        }
        DispatchError::Rejected { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "rejected"),
    };
    let body = serde_json::json!({"error": {"message": err.to_string(), "type": kind}});
    (status, Json(body)).into_response()
}

fn failure_outcome(err: &DispatchError) -> TransactionOutcome {
    let status_code = match err {
        DispatchError::ModelUnavailable(_) | DispatchError::ProviderCooling(_) | DispatchError::Exhausted { .. } => 503,
        DispatchError::Rejected { kind: ErrorKind::BadRequest, .. } => 400,
        DispatchError::Rejected { kind: ErrorKind::ContextWindow, .. } => 413,
        DispatchError::Rejected { .. } => 500,
    };
    TransactionOutcome::Failure {
        status_code,
        cause: err.to_string(),
    }
}

async fn archive(
    state: &AppState,
    request_id: &str,
    model: &ModelId,
    stream: bool,
    started: Instant,
    outcome: TransactionOutcome,
) {
    let transaction = Transaction {
        request_id: request_id.to_string(),
        timestamp_utc: now_rfc3339(),
        model: model.qualified(),
        stream,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome,
    };
    state.archiver.archive(&transaction).await;
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
