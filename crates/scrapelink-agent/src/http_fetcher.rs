//! HTTP implementation of [`ScrapeFetcher`]

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::fetch::{ScrapeFetcher, ScrapeResult};
use crate::metrics::{labels, AgentMetrics};
use crate::paths::PathTable;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use scrapelink_proto::ScrapeRequest;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fetches registered paths from their urls
pub struct HttpScrapeFetcher {
    client: reqwest::Client,
    paths: Arc<PathTable>,
    min_gzip_size_bytes: usize,
    timeout: Duration,
    metrics: Arc<AgentMetrics>,
}

impl HttpScrapeFetcher {
    /// `paths` is the table the agent keeps in step with the relay
    pub fn new(
        config: &AgentConfig,
        paths: Arc<PathTable>,
        metrics: Arc<AgentMetrics>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(config.scrape_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            paths,
            min_gzip_size_bytes: config.min_gzip_size_bytes,
            timeout: config.scrape_timeout,
            metrics,
        })
    }

    fn target_url(&self, request: &ScrapeRequest) -> Option<String> {
        let base = self.paths.url(&request.path)?;

        if request.encoded_query_params.is_empty() {
            return Some(base);
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        Some(format!(
            "{}{}{}",
            base,
            separator,
            request.encoded_query_params.trim_start_matches('?')
        ))
    }

    fn encode_body(&self, body: Bytes) -> (bool, Bytes) {
        if body.len() <= self.min_gzip_size_bytes {
            return (false, body);
        }
        match gzip(&body) {
            Ok(zipped) => (true, Bytes::from(zipped)),
            Err(e) => {
                warn!(error = %e, "Failed to gzip scrape body, sending uncompressed");
                (false, body)
            }
        }
    }
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

#[async_trait]
impl ScrapeFetcher for HttpScrapeFetcher {
    async fn fetch(&self, request: ScrapeRequest) -> ScrapeResult {
        let started = Instant::now();
        let result = self.fetch_url(request).await;
        self.metrics.record_scrape_latency(started.elapsed());
        result
    }
}

impl HttpScrapeFetcher {
    async fn fetch_url(&self, request: ScrapeRequest) -> ScrapeResult {
        let Some(url) = self.target_url(&request) else {
            self.metrics.record_scrape_request(labels::INVALID_PATH);
            let reason = format!("Invalid path: {}", request.path);
            return ScrapeResult::invalid(&request, 404, reason, "");
        };

        debug!(scrape_id = request.scrape_id, url = %url, "Fetching");

        let mut builder = self.client.get(&url).timeout(self.timeout);
        if !request.accept.is_empty() {
            builder = builder.header(ACCEPT, &request.accept);
        }
        if !request.auth_header.is_empty() {
            builder = builder.header(AUTHORIZATION, &request.auth_header);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.metrics.record_scrape_request(labels::TIMEOUT);
                let reason = format!("Timed out fetching {}", url);
                return ScrapeResult::invalid(&request, 408, reason, url);
            }
            Err(e) => {
                self.metrics.record_scrape_request(labels::UNSUCCESSFUL);
                let reason = format!("Failed fetching {}: {}", url, e);
                return ScrapeResult::invalid(&request, 503, reason, url);
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !status.is_success() {
            self.metrics.record_scrape_request(labels::UNSUCCESSFUL);
            let mut result = ScrapeResult::invalid(
                &request,
                status.as_u16(),
                format!("Unsuccessful response code {}", status),
                url,
            );
            result.content_type = content_type;
            return result;
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let label = if e.is_timeout() {
                    labels::TIMEOUT
                } else {
                    labels::UNSUCCESSFUL
                };
                self.metrics.record_scrape_request(label);
                let reason = format!("Failed reading {}: {}", url, e);
                return ScrapeResult::invalid(&request, 503, reason, url);
            }
        };

        self.metrics.record_scrape_request(labels::SUCCESS);
        let (zipped, content) = self.encode_body(body);

        ScrapeResult {
            agent_id: request.agent_id,
            scrape_id: request.scrape_id,
            valid_response: true,
            status_code: status.as_u16(),
            content_type,
            zipped,
            content,
            failure_reason: String::new(),
            url,
        }
    }
}
