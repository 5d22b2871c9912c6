//! Scrapelink Agent - scrape agent behind a firewall, serving a relay ("proxy")
//!
//! The agent dials out to the relay, registers the paths it can serve, and
//! answers scrape requests pushed down a long-lived stream by fetching the
//! configured local endpoints. Large results are split into checksummed chunks.
//!
//! # Example Usage
//!
//! ```no_run
//! use scrapelink_agent::{Agent, AgentConfig, AgentMetrics, HttpScrapeFetcher, PathTable};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::builder()
//!         .proxy_address("relay.example.com:50051")
//!         .agent_name("edge-1")
//!         .path("/node_metrics", "http://localhost:9100/metrics")
//!         .build()?;
//!
//!     let metrics = Arc::new(AgentMetrics::new());
//!     let paths = Arc::new(PathTable::new());
//!     let fetcher = HttpScrapeFetcher::new(&config, paths.clone(), metrics.clone())?;
//!     let agent = Agent::new(config, paths, Arc::new(fetcher), metrics)?;
//!     agent.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Connect**: open a channel and obtain an agent id
//! 2. **Register**: announce the agent, then every configured path
//! 3. **Serve**: read requests, fetch concurrently, write results back
//!    over a plain stream and a chunked stream
//! 4. **Heartbeat**: keep an idle connection alive
//! 5. **Reconnect**: on any failure, pause and start over

mod agent;
mod chunker;
mod config;
mod context;
mod dispatch;
mod error;
mod fetch;
mod heartbeat;
mod http_fetcher;
mod intake;
mod lifecycle;
mod metrics;
mod paths;
mod service;
mod session;
mod state;

#[cfg(test)]
mod test_support;

// Re-export public API
pub use agent::Agent;
pub use chunker::{
    ChunkedReassembler, ChunkedTransmission, EncodedResult, EncodingOutcome, ResultEncoder,
};
pub use config::{AgentConfig, AgentConfigBuilder, PathConfig};
pub use context::ConnectionContext;
pub use error::AgentError;
pub use fetch::{ScrapeFetcher, ScrapeResult};
pub use http_fetcher::HttpScrapeFetcher;
pub use lifecycle::ProxyLifecycle;
pub use metrics::{labels, AgentMetrics, LabeledCounter, LatencySummary, MetricSample};
pub use paths::PathTable;
pub use service::{
    AgentIdInterceptor, ProxyConnector, ProxyService, RpcConnector, RpcProxyClient,
    ScrapeRequestStream,
};
pub use session::{ProxyAddress, ProxySession};
pub use state::{AgentState, LifecycleState, StartGate};
