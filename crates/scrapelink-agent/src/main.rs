//! Scrapelink Agent - scrape agent CLI
//!
//! Runs an agent that connects to a relay and serves scrape requests for the
//! configured paths.

use anyhow::{Context, Result};
use clap::Parser;
use scrapelink_agent::{
    Agent, AgentConfig, AgentMetrics, HttpScrapeFetcher, PathConfig, PathTable,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SCRAPELINK_COMMIT"),
    ", built ",
    env!("SCRAPELINK_BUILT_AT"),
    ")"
);

/// Scrapelink agent - serves scrape requests arriving through a relay
#[derive(Parser, Debug)]
#[command(name = "scrapelink-agent")]
#[command(about = "Scrapelink agent - serves scrape requests arriving through a relay")]
#[command(version = VERSION)]
#[command(long_about = r#"
The Scrapelink agent dials out to a relay, registers the paths it serves,
and answers scrape requests by fetching the configured local endpoints.

EXAMPLES:
  # Serve node metrics through a relay
  scrapelink-agent --proxy relay.example.com:50051 \
    --path /node_metrics=http://localhost:9100/metrics

  # Start agent using config file
  scrapelink-agent --config agent.yaml --log-level debug

ENVIRONMENT VARIABLES:
  SCRAPELINK_PROXY        Relay address ([http://|https://]host[:port])
  SCRAPELINK_AGENT_NAME   Agent name
  SCRAPELINK_CONFIG       Configuration file
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "SCRAPELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Relay address (e.g., relay.example.com:50051)
    #[arg(long, env = "SCRAPELINK_PROXY")]
    proxy: Option<String>,

    /// Agent name (defaults to Unnamed-<hostname>)
    #[arg(long, env = "SCRAPELINK_AGENT_NAME")]
    name: Option<String>,

    /// Register as part of a consolidated group
    #[arg(long)]
    consolidated: bool,

    /// Path to serve, as `path=url` (repeatable)
    #[arg(long = "path", value_name = "PATH=URL")]
    paths: Vec<String>,

    /// Client certificate chain (PEM)
    #[arg(long, env = "SCRAPELINK_CERT_CHAIN")]
    cert_chain: Option<String>,

    /// Client private key (PEM)
    #[arg(long, env = "SCRAPELINK_PRIVATE_KEY")]
    private_key: Option<String>,

    /// Trusted CA certificates (PEM)
    #[arg(long, env = "SCRAPELINK_TRUST_CERTS")]
    trust_certs: Option<String>,

    /// TLS server name to verify instead of the relay host
    #[arg(long)]
    override_authority: Option<String>,

    /// Results of at least this many KB are sent chunked
    #[arg(long)]
    chunk_size_kbs: Option<usize>,

    /// Use the connect handshake that returns the agent id in the reply body
    #[arg(long)]
    transport_filter_disabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<AgentConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: AgentConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

fn parse_path_arg(arg: &str) -> Result<PathConfig> {
    let (path, url) = arg
        .split_once('=')
        .with_context(|| format!("Invalid --path {:?}, expected PATH=URL", arg))?;
    Ok(PathConfig {
        name: path.trim_start_matches('/').to_string(),
        path: path.to_string(),
        url: url.to_string(),
    })
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => AgentConfig::default(),
    };

    if let Some(proxy) = args.proxy {
        config.proxy_address = proxy;
    }
    if let Some(name) = args.name {
        config.agent_name = name;
    }
    if args.consolidated {
        config.consolidated = true;
    }
    if let Some(path) = args.cert_chain {
        config.cert_chain_path = path;
    }
    if let Some(path) = args.private_key {
        config.private_key_path = path;
    }
    if let Some(path) = args.trust_certs {
        config.trust_cert_collection_path = path;
    }
    if let Some(authority) = args.override_authority {
        config.override_authority = authority;
    }
    if let Some(kbs) = args.chunk_size_kbs {
        config.chunk_content_size_kbs = kbs;
    }
    if args.transport_filter_disabled {
        config.transport_filter_disabled = true;
    }
    for arg in &args.paths {
        config.paths.push(parse_path_arg(arg)?);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!(version = VERSION, "Starting Scrapelink Agent");

    let config = build_agent_config(args)?;

    info!("Agent configuration:");
    info!("  Proxy: {}", config.proxy_address);
    info!("  Name: {}", config.agent_name);
    info!("  Consolidated: {}", config.consolidated);
    info!("  Chunk size: {} KB", config.chunk_content_size_kbs);
    for entry in &config.paths {
        info!("  Path: /{} -> {}", entry.path.trim_start_matches('/'), entry.url);
    }
    if config.paths.is_empty() {
        warn!("No paths configured, the relay will have nothing to scrape");
    }

    let metrics = Arc::new(AgentMetrics::new());
    let paths = Arc::new(PathTable::new());
    let fetcher = HttpScrapeFetcher::new(&config, paths.clone(), metrics.clone())
        .context("Failed to create fetcher")?;
    let agent = Agent::new(config, paths, Arc::new(fetcher), metrics)
        .context("Failed to create agent")?;
    let agent = Arc::new(agent);

    let runner = agent.clone();
    let mut run = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut run => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Agent error: {}", e);
                    return Err(e.into());
                }
                Err(e) => return Err(e).context("Agent task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            agent.stop().await;
            if let Ok(Err(e)) = run.await {
                warn!("Agent stopped with error: {}", e);
            }
        }
    }

    for sample in agent.metrics_snapshot() {
        info!(
            metric = sample.name,
            launch_id = %sample.launch_id,
            label = %sample.label,
            value = sample.value,
            "Final count"
        );
    }

    info!("Agent stopped");
    Ok(())
}
