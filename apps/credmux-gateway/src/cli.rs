use clap::Parser;

/// Runtime configuration, matching spec.md §6's "Environment input" and
/// `config` table. Every field is also settable as an environment variable
/// via `clap`'s `env` feature.
#[derive(Parser, Debug)]
#[command(name = "credmux-gateway")]
pub struct Cli {
    #[arg(long, default_value = "127.0.0.1", env = "HOST")]
    pub host: String,

    #[arg(long, default_value_t = 8080, env = "PORT")]
    pub port: u16,

    /// Path to the persisted ledger file. Unset disables persistence.
    #[arg(long, env = "LEDGER_PATH")]
    pub ledger_path: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 30, env = "RETENTION_DAYS")]
    pub retention_days: u32,

    /// OAuth credential early-refresh window, spec.md §6 `refresh_skew_seconds`.
    #[arg(long, default_value_t = 120, env = "REFRESH_SKEW_SECONDS")]
    pub refresh_skew_seconds: i64,

    /// Model cache refresh interval, seconds.
    #[arg(long, default_value_t = 21_600, env = "MODEL_CACHE_TTL")]
    pub model_cache_ttl: u64,

    /// Per-request deadline handed to the dispatcher, spec.md §6
    /// `global_request_deadline`.
    #[arg(long, default_value_t = 60_000, env = "GLOBAL_REQUEST_DEADLINE_MS")]
    pub global_request_deadline_ms: u64,

    #[arg(long, default_value_t = 3, env = "MAX_ATTEMPTS_UNKNOWN")]
    pub max_attempts_unknown: u32,

    /// Directory to append one JSON line per transaction to. Unset disables
    /// archival (spec.md §6 "Per-transaction archival").
    #[arg(long, env = "TRANSACTION_LOG_DIR")]
    pub transaction_log_dir: Option<std::path::PathBuf>,
}
