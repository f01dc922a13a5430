//! Herald - Leader Election over etcd
//!
//! Runs one election participant with its HTTP status endpoint, or
//! queries, generates and validates node configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald::api::StatusServer;
use herald::config::{Backend, HeraldConfig};
use herald::election::{CandidateRecord, ElectionController};
use herald::state::RoleState;
use herald::store;

/// Herald - Leader Election over etcd
#[derive(Parser)]
#[command(name = "herald")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "herald.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election and serve the status endpoint
    Start {
        /// Status endpoint port, also the advertised leader value
        #[arg(short, long)]
        port: Option<u16>,

        /// Comma-separated etcd endpoints
        #[arg(long, value_delimiter = ',')]
        etcd_endpoints: Option<Vec<String>>,

        /// Coordination backend
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },

    /// Query a running node's status endpoint
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "herald.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            etcd_endpoints,
            backend,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(endpoints) = etcd_endpoints {
                config.store.endpoints = endpoints;
            }
            if let Some(backend) = backend {
                config.store.backend = backend;
            }
            config.validate().context("invalid configuration")?;

            let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level);
            run_start(config).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_status(address).await
        }
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_validate(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file, or defaults when it does not exist
fn load_config(path: &Path) -> Result<HeraldConfig> {
    if path.exists() {
        HeraldConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    } else {
        Ok(HeraldConfig::default())
    }
}

/// Wait for Ctrl-C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Start the Herald node
async fn run_start(config: HeraldConfig) -> Result<()> {
    tracing::info!("Starting Herald node on port {}", config.node.port);

    let timings = config.timings();
    let store = store::connect(&config.store, &timings)
        .context("failed to create coordination store client")?;
    let candidate = CandidateRecord::new(
        config.election_key(),
        config.advertised_value(),
        timings.session_ttl,
    )
    .context("invalid advertised leader value")?;

    let state = Arc::new(RoleState::new());
    let server = StatusServer::new(config.bind_address(), Arc::clone(&state));
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind status endpoint on {}", config.bind_address()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let election =
        ElectionController::new(store, candidate, timings, Arc::clone(&state), shutdown_rx.clone())
            .spawn();
    let mut http = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Received shutdown signal");
        }
        result = &mut http => {
            match result {
                Ok(Ok(())) => tracing::warn!("Status endpoint stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("Status endpoint failed: {}", e),
                Err(e) => tracing::error!("Status endpoint task failed: {}", e),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = election.await {
        tracing::error!("Election task failed: {}", e);
    }
    if !http.is_finished() {
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Status endpoint failed: {}", e),
            Err(e) => tracing::error!("Status endpoint task failed: {}", e),
        }
    }

    tracing::info!("Herald shutdown complete ({})", state.status_line());
    Ok(())
}

/// Query a node's status
async fn run_status(address: String) -> Result<()> {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address
    } else {
        format!("http://{}/", address)
    };

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to query {}", url))?;
    let body = response.text().await.context("failed to read status response")?;
    println!("{}", body);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# Herald Configuration
# Generated configuration file

[node]
# Status endpoint port; also the value published when this node leads
port = 8080
bind_host = "0.0.0.0"
# advertise = "node-1.example.com:8080"

[store]
# "session" (etcd v3 leases + watch) or "poll" (etcd v2 TTL keys + polling)
backend = "session"
endpoints = ["127.0.0.1:2379"]
# key = "/leader-election/"   # default for session, "leader" for poll
request_timeout_ms = 5000

[election]
# session_ttl_secs = 5        # default 5 for session, 15 for poll
session_retry_ms = 5000
campaign_timeout_ms = 2000
follower_window_ms = 5000
cycle_delay_ms = 1000
# Poll backend only; renew_interval_ms must stay below the session TTL
poll_interval_ms = 10000
renew_interval_ms = 10000

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: herald start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match HeraldConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Port:        {}", config.node.port);
            println!("  Advertise:   {}", config.advertised_value());
            println!("  Backend:     {:?}", config.store.backend);
            println!("  Endpoints:   {}", config.store.endpoints.join(", "));
            println!("  Key:         {}", config.election_key());
            println!("  Session TTL: {}s", config.session_ttl().as_secs());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
