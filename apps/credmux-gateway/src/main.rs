mod archiver;
mod cli;
mod credentials;
mod http;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use credmux_ledger::{CooldownController, LedgerConfig, UsageLedger};
use credmux_modelcache::{ModelCache, ModelCacheConfig};
use credmux_provider::OAuthStore;

use crate::archiver::{JsonlArchiver, NoopArchiver, TransactionArchiver};
use crate::cli::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let clock: Arc<dyn credmux_common::Clock> = Arc::new(credmux_common::SystemClock);
    let http = wreq::Client::new();
    let oauth = Arc::new(OAuthStore::new(clock.clone(), cli.refresh_skew_seconds, http.clone()));

    let ingested = credentials::ingest_from_env(http.clone(), oauth.clone());
    let flat_credentials = credentials::flatten(&ingested.credentials);
    let registry = Arc::new(ingested.registry);

    let ledger = UsageLedger::load(
        clock.clone(),
        LedgerConfig {
            path: cli.ledger_path.clone(),
            retention_days: cli.retention_days,
            debounce: Duration::from_millis(500),
        },
    )
    .await;
    let cooldowns = Arc::new(CooldownController::new(clock.clone()));
    let modelcache = ModelCache::start(
        registry.clone(),
        ingested.credentials,
        ModelCacheConfig {
            refresh_interval: Duration::from_secs(cli.model_cache_ttl),
        },
    )
    .await;

    let dispatcher = Arc::new(credmux_dispatch::Dispatcher::new(
        ledger.clone(),
        cooldowns,
        modelcache,
        registry,
        flat_credentials,
        credmux_dispatch::DispatcherConfig {
            max_attempts_unknown: cli.max_attempts_unknown,
        },
    ));

    let archiver: Arc<dyn TransactionArchiver> = match &cli.transaction_log_dir {
        Some(dir) => Arc::new(JsonlArchiver::new(dir.clone())?),
        None => Arc::new(NoopArchiver),
    };

    let state = http::AppState {
        dispatcher,
        archiver,
        request_deadline: Duration::from_millis(cli.global_request_deadline_ms),
    };
    let app = http::router(state);

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(address = %bind, "credmux-gateway listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    ledger.flush().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal, flushing ledger");
}
