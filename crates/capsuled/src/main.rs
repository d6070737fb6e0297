//! capsuled — the capsule build and egress daemon.
//!
//! Single binary that assembles:
//! - Index store (redb) and blob store (filesystem)
//! - Build pipeline and artifact compile worker
//! - Tiered rate limiter
//! - Identity verifier
//! - REST API and egress proxy
//!
//! # Usage
//!
//! ```text
//! capsuled --config /etc/capsule/capsule.toml --port 8080 --log-format json
//! ```

mod sweeper;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use capsule_api::{build_router, AppState};
use capsule_auth::IdentityVerifier;
use capsule_build::{compile_queue, BuildPipeline, CompileWorker};
use capsule_core::CapsuleConfig;
use capsule_ratelimit::TieredLimiter;
use capsule_state::{ContentStore, FsBlobStore, KvStore, MemoryKv, StateStore};

use crate::sweeper::Sweeper;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "capsuled", about = "Capsule build and egress daemon")]
struct Cli {
    /// Path to capsule.toml. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Listen port, overriding the port of the listen address.
    #[arg(long, short)]
    port: Option<u16>,

    /// Data directory, overriding `server.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,capsuled=debug,capsule=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => CapsuleConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CapsuleConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(port) = cli.port {
        let mut addr: SocketAddr = config
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", config.server.listen))?;
        addr.set_port(port);
        config.server.listen = addr.to_string();
    }
    if let Some(dir) = cli.data_dir {
        config.server.data_dir = dir.to_string_lossy().into_owned();
    }
    run(config).await
}

async fn run(config: CapsuleConfig) -> anyhow::Result<()> {
    info!("capsule daemon starting");

    let data_dir = PathBuf::from(&config.server.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("capsule.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "index store opened");

    let blobs = FsBlobStore::new(data_dir.join("blobs"));
    let content = ContentStore::new(store.clone(), Arc::new(blobs));

    let kv = Arc::new(MemoryKv::new());
    let kv_dyn: Arc<dyn KvStore> = kv.clone();

    let limiter = Arc::new(TieredLimiter::from_config(
        &config.rate_limit,
        store.clone(),
        kv_dyn.clone(),
    ));
    info!(shards = config.rate_limit.shards, "rate limiter initialized");

    if config.auth.issuer.is_empty() {
        warn!("auth.issuer is not set; every authenticated request will be rejected");
    }
    let verifier = Arc::new(IdentityVerifier::from_config(&config)?);

    if config.egress.allowlist.is_empty() {
        warn!("egress.allowlist is empty; the proxy will refuse every target");
    }

    let bundler = capsule_pack::from_config(&config.bundler);
    let pipeline = BuildPipeline::new(content, bundler, Arc::new(config.clone()));
    let (queue, jobs) = compile_queue(config.server.compile_queue_depth);

    let state = AppState::new(pipeline.clone(), kv_dyn, limiter, verifier, queue)?;

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = CompileWorker::new(pipeline);
    let worker_shutdown = shutdown_rx.clone();
    let worker_handle = tokio::spawn(async move {
        worker.run(jobs, worker_shutdown).await;
    });

    let sweeper = Sweeper::new(store, kv, SWEEP_INTERVAL);
    let sweeper_shutdown = shutdown_rx.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = build_router(state);
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = worker_handle.await;
    let _ = sweeper_handle.await;

    info!("capsule daemon stopped");
    Ok(())
}
