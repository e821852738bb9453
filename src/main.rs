#![forbid(unsafe_code)]

//! `chat-courier` — rule-driven chat relay binary.
//!
//! Bootstraps configuration, recovers the durable queue, spawns the
//! endpoint harness process, and runs the forwarding pipeline until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use chat_courier::config::CourierConfig;
use chat_courier::driver::harness::HarnessDriver;
use chat_courier::queue::store::QueueStore;
use chat_courier::queue::DurableQueue;
use chat_courier::relay::RelayService;
use chat_courier::rules::RuleTable;
use chat_courier::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "chat-courier", about = "Rule-driven chat relay", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("chat-courier bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = CourierConfig::load_from_path(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let config = Arc::new(config);
    info!(rules = config.rules.len(), "configuration loaded");

    // ── Recover the durable queue ───────────────────────
    let store = QueueStore::new(&config.data_dir)?;
    let (queue, recovery) = DurableQueue::open(store, config.queue.history_cap);
    let queue = Arc::new(queue);
    if recovery.needs_attention() {
        // Restarts never auto-resume in-flight work; the operator decides
        // what to retry or delete.
        warn!(
            pending = recovery.pending,
            failed = recovery.failed,
            reinstated = recovery.reinstated,
            "recovered unfinished tasks from a previous run; review before restarting delivery"
        );
    }

    // ── Spawn the endpoint harness ──────────────────────
    let ct = CancellationToken::new();
    let (driver, inbound_rx) = HarnessDriver::spawn(&config.harness, ct.clone()).await?;

    // ── Assemble and start the pipeline ─────────────────
    let rules = Arc::new(RuleTable::new(
        config.rules.clone(),
        config.operator_name.clone(),
    ));
    let service = RelayService::new(Arc::clone(&config), rules, queue, driver);
    service.start_forwarding(inbound_rx).await?;
    info!("forwarding pipeline ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    service.stop_forwarding().await;
    ct.cancel();

    info!("chat-courier shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
