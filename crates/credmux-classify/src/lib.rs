//! Maps heterogeneous upstream failures (HTTP responses, transport errors)
//! onto a small closed taxonomy with retry hints. Pure: no I/O, no locks,
//! no clock reads — classification never needs to know "now".

mod kind;
mod sentence;

pub use kind::{ClassifiedError, ErrorKind};

use credmux_common::{ModelId, ProviderTag};

/// Raw signal handed to the classifier by a provider plugin. Plugins build
/// this from whatever their wire protocol actually returned; the classifier
/// never sees provider-specific payload shapes beyond a JSON `Value`.
pub struct RawFailure<'a> {
    pub status_code: Option<u16>,
    /// Lowercased header name -> value, so classification doesn't care about
    /// a given HTTP stack's casing conventions.
    pub headers: &'a [(String, String)],
    pub body: Option<&'a serde_json::Value>,
    pub message: Option<&'a str>,
    pub is_timeout: bool,
    pub is_transport: bool,
}

impl<'a> RawFailure<'a> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Classifies a raw upstream failure into the closed taxonomy from the
/// credential-rotation design. This function performs no I/O and mutates no
/// state; the caller (the rotating dispatcher) decides what to do with the
/// result.
pub fn classify(
    provider: ProviderTag,
    model: ModelId,
    credential: String,
    failure: RawFailure<'_>,
    cause: String,
) -> ClassifiedError {
    let retry_after_seconds = retry_after_hint(&failure);

    let kind = if failure.is_transport {
        ErrorKind::Transport
    } else if failure.is_timeout {
        ErrorKind::Timeout
    } else {
        match failure.status_code {
            Some(400) => ErrorKind::BadRequest,
            Some(401) | Some(403) => ErrorKind::Auth,
            Some(408) | Some(504) => ErrorKind::Timeout,
            Some(429) => ErrorKind::RateLimit,
            Some(code) if (500..600).contains(&code) => ErrorKind::ServerError,
            _ => {
                if is_context_window_overflow(&failure) {
                    ErrorKind::ContextWindow
                } else {
                    ErrorKind::Unknown
                }
            }
        }
    };

    // Context-window overflows are sometimes reported as 400s with a
    // message substring rather than a dedicated status code; re-check for
    // that case even when the status code already looked like bad_request.
    let kind = if kind == ErrorKind::BadRequest && is_context_window_overflow(&failure) {
        ErrorKind::ContextWindow
    } else {
        kind
    };

    let provider_wide = kind == ErrorKind::RateLimit && is_provider_wide_rate_limit(&failure);

    ClassifiedError {
        kind,
        retry_after_seconds,
        status_code: failure.status_code,
        provider,
        model,
        credential,
        cause,
        provider_wide,
    }
}

fn is_provider_wide_rate_limit(failure: &RawFailure<'_>) -> bool {
    failure
        .header("x-ratelimit-scope")
        .map(|scope| {
            let scope = scope.to_ascii_lowercase();
            scope == "ip" || scope == "provider" || scope == "global"
        })
        .unwrap_or(false)
}

fn retry_after_hint(failure: &RawFailure<'_>) -> Option<u64> {
    if let Some(header) = failure.header("retry-after")
        && let Ok(seconds) = header.trim().parse::<u64>()
    {
        return Some(seconds);
    }

    if let Some(body) = failure.body {
        for field in ["retry_after", "retry_after_seconds", "retryAfter"] {
            if let Some(value) = body.get(field) {
                if let Some(seconds) = value.as_u64() {
                    return Some(seconds);
                }
                if let Some(seconds) = value.as_f64() {
                    return Some(seconds.round() as u64);
                }
            }
        }
    }

    let text = failure.message.or_else(|| failure.body.and_then(|b| b.as_str()));
    text.and_then(sentence::parse_retry_seconds)
}

fn is_context_window_overflow(failure: &RawFailure<'_>) -> bool {
    const NEEDLES: &[&str] = &[
        "context length",
        "context_length_exceeded",
        "maximum context length",
        "too many tokens",
        "context window",
        "exceeds the model's maximum",
    ];
    let message = failure
        .message
        .map(str::to_ascii_lowercase)
        .or_else(|| {
            failure
                .body
                .and_then(|body| body.get("error").and_then(|e| e.get("message")))
                .and_then(|v| v.as_str())
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_default();
    NEEDLES.iter().any(|needle| message.contains(needle))
}
