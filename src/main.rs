use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::clock::SystemClock;
use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::filter::{AdmissionFilter, FailurePolicy};
use floodgate::ratelimit::{Engine, Rule, RuleRegistry};
use floodgate::server::HttpServer;
use floodgate::store::{MemoryStore, RedisStore, SharedStore};

/// Request admission filter backed by a shared rate limit store.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// YAML service configuration file
    #[arg(short, long, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Rule file, overrides `rate_limiting.rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Store backend, overrides `store.backend`
    #[arg(long, value_parser = parse_backend)]
    store: Option<StoreBackend>,

    /// Reject requests when the limiter fails instead of admitting them
    #[arg(long)]
    fail_closed: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn parse_backend(raw: &str) -> Result<StoreBackend, String> {
    match raw {
        "redis" => Ok(StoreBackend::Redis),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(format!("unknown store backend {other:?} (expected redis or memory)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Floodgate admission filter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(cli.config.as_deref())?;
    if let Some(rules) = cli.rules {
        config.rate_limiting.rules_path = rules;
    }
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if cli.fail_closed {
        config.rate_limiting.failure_policy = FailurePolicy::FailClosed;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.store.backend,
        failure_policy = ?config.rate_limiting.failure_policy,
        sliding_log_trim = ?config.rate_limiting.sliding_log_trim,
        "Configuration loaded"
    );

    let store: Arc<dyn SharedStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.store.url, config.store.command_timeout()).await?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between instances");
            Arc::new(MemoryStore::new())
        }
    };

    let rule = Rule::load_or_default(&config.rate_limiting.rules_path);
    let registry = RuleRegistry::new(store.clone());
    if let Err(e) = registry.publish(&rule).await {
        warn!(error = %e, "Could not publish rule, continuing with the stored one");
    }

    let engine = Engine::new(
        store,
        Arc::new(SystemClock::new()),
        config.rate_limiting.sliding_log_trim,
    );
    let filter = Arc::new(AdmissionFilter::new(
        registry,
        engine,
        config.rate_limiting.failure_policy,
    ));
    info!("Admission filter initialized");

    HttpServer::new(config.server.listen_addr, filter)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Floodgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
