//! # Network Inventory Controller
//!
//! A controller that keeps a local entity store converged with a
//! cloud-network provider's topology.
//!
//! ## Overview
//!
//! Each refresh pass:
//!
//! 1. **Fetches** raw entity listings from the provider API (enterprises,
//!    policy groups, subnets) over authenticated HTTPS
//! 2. **Parses** them into normalized network groups, security groups and
//!    cloud subnets
//! 3. **Builds** an immutable, cross-referenced inventory graph
//! 4. **Reconciles** the graph against the store: creates, updates and
//!    deletes rows until the mirror matches provider state exactly
//!
//! Passes are idempotent: a second run on unchanged provider data changes
//! nothing. The save strategy (direct, batch with or without object
//! materialization, recursive) is configurable per connection and all
//! strategies converge to identical store state.
//!
//! ## Features
//!
//! - **Daemon or one-shot**: periodic refresh loop with Fibonacci backoff
//!   after failures, or a single pass with `--once`
//! - **Prometheus metrics**: refresh counts, durations, per-kind row changes
//! - **Health probes**: HTTP endpoints for liveness and readiness checks

use anyhow::{bail, Context, Result};
use clap::Parser;
use network_inventory_controller::backoff::FibonacciBackoff;
use network_inventory_controller::constants::{
    DEFAULT_METRICS_PORT, DEFAULT_REFRESH_INTERVAL_SECS, MIN_REFRESH_INTERVAL_SECS,
};
use network_inventory_controller::server::{start_server, ServerState};
use network_inventory_controller::{
    metrics, ConnectionConfig, InMemoryStore, NetworkApiClient, Refresher, SaveStrategy, Secret,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "network-inventory-controller", version)]
struct Cli {
    /// Path to the connection config file (YAML)
    #[arg(long, default_value = "connection.yaml")]
    config: PathBuf,

    /// Run a single refresh pass and exit
    #[arg(long)]
    once: bool,

    /// Seconds between refresh passes in daemon mode
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Port for the metrics and probe HTTP server
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Override the configured save strategy (direct, batch, recursive)
    #[arg(long)]
    strategy: Option<String>,

    /// Override object materialization for batch saves
    #[arg(long)]
    materialize: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("BUILD_GIT_HASH"),
        built = env!("BUILD_DATETIME"),
        "starting network-inventory-controller"
    );

    let config = load_config(&cli)?;

    metrics::register_metrics().context("failed to register metrics")?;
    let state = Arc::new(ServerState::default());
    let server_state = Arc::clone(&state);
    let metrics_port = cli.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state).await {
            error!("metrics server exited: {e}");
        }
    });

    let collector = Arc::new(
        NetworkApiClient::new(&config).context("failed to build provider API client")?,
    );
    // The bundled store is in-memory; production deployments swap in a
    // relational EntityStore implementation here
    let store = Arc::new(InMemoryStore::new());
    let refresher = Refresher::new(collector, store);

    if cli.once {
        refresher.refresh(config.id, config.save).await?;
        state.set_ready();
        return Ok(());
    }

    let mut interval_secs = cli.interval_secs.unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    if interval_secs < MIN_REFRESH_INTERVAL_SECS {
        warn!(
            requested = interval_secs,
            minimum = MIN_REFRESH_INTERVAL_SECS,
            "refresh interval below minimum, clamping"
        );
        interval_secs = MIN_REFRESH_INTERVAL_SECS;
    }

    let mut backoff = FibonacciBackoff::new(
        network_inventory_controller::constants::DEFAULT_REFRESH_BACKOFF_MIN_SECS,
        network_inventory_controller::constants::DEFAULT_REFRESH_BACKOFF_MAX_SECS,
    );
    loop {
        match refresher.refresh(config.id, config.save).await {
            Ok(_) => {
                state.set_ready();
                backoff.reset();
                tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            }
            Err(_) => {
                // refresh() already logged the failure with its phase
                let delay = backoff.next_backoff();
                warn!(delay_secs = delay.as_secs(), "backing off before next refresh");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<ConnectionConfig> {
    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read config file {}", cli.config.display()))?;
    let mut config: ConnectionConfig =
        serde_yaml::from_str(&raw).context("failed to parse connection config")?;

    if config.password.is_empty() {
        let password = std::env::var("NETWORK_API_PASSWORD").context(
            "config carries no password and NETWORK_API_PASSWORD is not set",
        )?;
        config.password = Secret::new(password);
    }

    config.save = apply_overrides(config.save, cli)?;
    info!(
        connection = %config.id,
        endpoint = %config.endpoint,
        strategy = ?config.save.strategy,
        materialize = config.save.materialize,
        "loaded connection config"
    );
    Ok(config)
}

fn apply_overrides(
    mut save: network_inventory_controller::SaveOptions,
    cli: &Cli,
) -> Result<network_inventory_controller::SaveOptions> {
    if let Some(strategy) = cli.strategy.as_deref() {
        save.strategy = match strategy {
            "direct" => SaveStrategy::Direct,
            "batch" => SaveStrategy::Batch,
            "recursive" => SaveStrategy::Recursive,
            other => bail!("unknown save strategy `{other}` (expected direct, batch or recursive)"),
        };
    }
    if let Some(materialize) = cli.materialize {
        save.materialize = materialize;
    }
    Ok(save)
}
