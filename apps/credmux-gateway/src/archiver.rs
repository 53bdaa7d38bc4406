use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

/// One completed transaction, logged independently of the ledger's
/// aggregate counters (spec.md §6 "Per-transaction archival"). The core
/// crates never see this type; it's built and consumed entirely by the
/// gateway binary around a dispatch call.
#[derive(Debug, Serialize)]
pub struct Transaction {
    pub request_id: String,
    pub timestamp_utc: String,
    pub model: String,
    pub stream: bool,
    pub duration_ms: u64,
    pub outcome: TransactionOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Success { prompt_tokens: u64, completion_tokens: u64 },
    Failure { status_code: u16, cause: String },
}

/// Injected collaborator for per-transaction archival, grounded on
/// `original_source/src/proxy_app/detailed_logger.py`'s per-request
/// directory logger but reshaped behind a trait object (one append per
/// transaction rather than a directory of files per request).
#[async_trait]
pub trait TransactionArchiver: Send + Sync {
    async fn archive(&self, transaction: &Transaction);
}

#[derive(Debug, Default)]
pub struct NoopArchiver;

#[async_trait]
impl TransactionArchiver for NoopArchiver {
    async fn archive(&self, _transaction: &Transaction) {}
}

/// Appends one JSON line per transaction to `<dir>/transactions.jsonl`,
/// matching `detailed_logger.py`'s `streaming_chunks.jsonl`/metadata split,
/// collapsed here into a single append-only file since the core only needs
/// the summary, not the full request/response bodies.
pub struct JsonlArchiver {
    path: PathBuf,
}

impl JsonlArchiver {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("transactions.jsonl"),
        })
    }
}

#[async_trait]
impl TransactionArchiver for JsonlArchiver {
    async fn archive(&self, transaction: &Transaction) {
        let Ok(mut line) = serde_json::to_string(transaction) else {
            tracing::warn!(request_id = %transaction.request_id, "failed to serialize transaction");
            return;
        };
        line.push('\n');
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to append transaction log"),
            Err(err) => tracing::warn!(error = %err, "transaction log append task panicked"),
        }
    }
}
