use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, StoreConfig, TollgateConfig};
use tollgate::error::TollgateError;
use tollgate::grpc::{GrpcLimiterBackend, GrpcServer};
use tollgate::ratelimit::{Limit, LimitRules, Limiter, LimiterBackend, LimiterService, MaxWait};
use tollgate::store::{FileStore, MemoryStore, StateStore};

const CANCEL_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Keyed token-bucket rate limiting service")]
struct Cli {
    /// YAML configuration file; `TOLLGATE__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Server to talk to for client commands [default: http://<server.grpc_addr>]
    #[arg(long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gRPC server
    Serve,
    /// Print the persisted state of a limiter
    State { key: String },
    /// Print the tokens available now
    Tokens { key: String },
    /// Reserve permits and print the reservation
    Reserve {
        key: String,
        #[arg(short, long, default_value_t = 1)]
        n: u32,
        /// Only grant if actionable within this many milliseconds
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },
    /// Change the limit and/or burst of a limiter
    SetRate {
        key: String,
        /// Permits per second, or `inf`
        #[arg(long)]
        limit: Option<Limit>,
        #[arg(long)]
        burst: Option<u32>,
    },
    /// Block until permits are available; Ctrl+C cancels the reservation
    Wait {
        key: String,
        #[arg(short, long, default_value_t = 1)]
        n: u32,
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}", config.server.grpc_addr));

    match cli.command {
        Command::Serve => serve(config).await,
        Command::State { key } => {
            let state = connect(&endpoint).await?.state(&key).await?;
            print_json(&state)
        }
        Command::Tokens { key } => {
            let tokens = connect(&endpoint).await?.tokens(&key).await?;
            println!("{}", tokens);
            Ok(())
        }
        Command::Reserve {
            key,
            n,
            max_wait_ms,
        } => {
            let reservation = connect(&endpoint)
                .await?
                .reserve_n(&key, n, max_wait(max_wait_ms))
                .await?;
            print_json(&reservation)
        }
        Command::SetRate { key, limit, burst } => {
            if limit.is_none() && burst.is_none() {
                anyhow::bail!("nothing to change: pass --limit and/or --burst");
            }
            connect(&endpoint).await?.set_rate(&key, limit, burst).await?;
            Ok(())
        }
        Command::Wait {
            key,
            n,
            max_wait_ms,
        } => wait(&endpoint, key, n, max_wait(max_wait_ms)).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn serve(config: TollgateConfig) -> anyhow::Result<()> {
    info!("Starting Tollgate rate limiting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config.limiter.store).await?;
    let mut service = LimiterService::new(store);
    if let Some(path) = &config.limiter.rules_path {
        let rules = LimitRules::from_file(path)
            .with_context(|| format!("loading rules from {}", path))?;
        service = service.with_rules(rules);
    }

    info!(
        grpc_addr = %config.server.grpc_addr,
        store = ?config.limiter.store,
        "Limiter service initialized"
    );

    GrpcServer::new(config.server.grpc_addr, Arc::new(service))
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate rate limiting service stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    Ok(match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::File { dir } => Arc::new(
            FileStore::open(dir)
                .await
                .with_context(|| format!("opening state directory {}", dir.display()))?,
        ),
    })
}

async fn connect(endpoint: &str) -> anyhow::Result<GrpcLimiterBackend> {
    GrpcLimiterBackend::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {}", endpoint))
}

async fn wait(endpoint: &str, key: String, n: u32, max_wait: MaxWait) -> anyhow::Result<()> {
    let limiter = Limiter::new(Arc::new(connect(endpoint).await?), key.clone());

    let interrupted = async {
        if signal::ctrl_c().await.is_err() {
            // Without a handler the wait can only end on its own
            std::future::pending::<()>().await;
        }
        warn!(key = %key, n = n, "Interrupted, cancelling reservation");
    };

    match limiter.wait_n_or_cancel(n, max_wait, interrupted).await {
        Ok(()) => {
            info!(key = %key, n = n, "Permits available");
            Ok(())
        }
        Err(TollgateError::Cancelled) => {
            // The cancellation runs on a spawned task; keep the runtime up for it
            tokio::time::sleep(CANCEL_GRACE).await;
            Err(TollgateError::Cancelled.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn max_wait(ms: Option<u64>) -> MaxWait {
    ms.map(|ms| MaxWait::Within(Duration::from_millis(ms)))
        .unwrap_or(MaxWait::Unbounded)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
