//! Fetch collaborator seam and the worker that runs accepted fetch jobs

use crate::state::AgentState;
use async_trait::async_trait;
use bytes::Bytes;
use scrapelink_proto::{ChunkedHeader, ScrapeRequest, ScrapeResponse};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

/// Outcome of one fetch, immutable once produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeResult {
    pub agent_id: String,
    pub scrape_id: u64,
    pub valid_response: bool,
    pub status_code: u16,
    pub content_type: String,
    /// `content` is gzip-compressed
    pub zipped: bool,
    pub content: Bytes,
    pub failure_reason: String,
    pub url: String,
}

impl ScrapeResult {
    /// Failed fetch for `request`
    pub fn invalid(
        request: &ScrapeRequest,
        status_code: u16,
        reason: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            scrape_id: request.scrape_id,
            valid_response: false,
            status_code,
            failure_reason: reason.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn to_scrape_response(&self) -> ScrapeResponse {
        ScrapeResponse {
            agent_id: self.agent_id.clone(),
            scrape_id: self.scrape_id,
            valid_response: self.valid_response,
            status_code: self.status_code,
            content_type: self.content_type.clone(),
            zipped: self.zipped,
            content: self.content.to_vec(),
            failure_reason: self.failure_reason.clone(),
            url: self.url.clone(),
        }
    }

    pub fn to_chunked_header(&self) -> ChunkedHeader {
        ChunkedHeader {
            agent_id: self.agent_id.clone(),
            scrape_id: self.scrape_id,
            valid_response: self.valid_response,
            status_code: self.status_code,
            content_type: self.content_type.clone(),
            failure_reason: self.failure_reason.clone(),
            url: self.url.clone(),
            content_size: self.content.len() as u64,
        }
    }
}

/// Turns a scrape request into a result
///
/// Implementations report fetch failures inside the result
/// (`valid_response = false`) rather than as errors.
#[async_trait]
pub trait ScrapeFetcher: Send + Sync {
    async fn fetch(&self, request: ScrapeRequest) -> ScrapeResult;
}

/// Deferred fetch of one accepted request
pub struct FetchJob {
    request: ScrapeRequest,
    fetcher: Arc<dyn ScrapeFetcher>,
}

impl fmt::Debug for FetchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchJob")
            .field("scrape_id", &self.request.scrape_id)
            .field("path", &self.request.path)
            .finish()
    }
}

impl FetchJob {
    pub fn new(request: ScrapeRequest, fetcher: Arc<dyn ScrapeFetcher>) -> Self {
        Self { request, fetcher }
    }

    pub fn scrape_id(&self) -> u64 {
        self.request.scrape_id
    }

    pub async fn run(self) -> ScrapeResult {
        self.fetcher.fetch(self.request).await
    }
}

/// Run every job from `jobs`, each as its own task, sending results to `results`
///
/// Returns after `jobs` closes and the accepted jobs have finished, or after
/// `drain_timeout` when the remaining jobs are aborted. Every job that does
/// not deliver a result takes itself off the backlog.
pub async fn run_fetch_jobs(
    mut jobs: mpsc::UnboundedReceiver<FetchJob>,
    results: mpsc::UnboundedSender<ScrapeResult>,
    state: Arc<AgentState>,
    drain_timeout: Duration,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => {
                    let results = results.clone();
                    let state = state.clone();
                    in_flight.spawn(async move {
                        let scrape_id = job.scrape_id();
                        let result = job.run().await;
                        if results.send(result).is_err() {
                            debug!(scrape_id = scrape_id, "Result queue closed, dropping result");
                            state.decrement_backlog();
                        }
                    });
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                settle(joined, &state);
            }
        }
    }

    let pending = in_flight.len();
    if pending > 0 {
        debug!(pending = pending, "Draining in-flight fetch jobs");
    }

    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(joined) = in_flight.join_next().await {
            settle(joined, &state);
        }
    })
    .await;

    if drained.is_err() {
        let aborted = in_flight.len();
        warn!(aborted = aborted, "Fetch jobs still running after drain timeout, aborting");
        in_flight.abort_all();
        while let Some(joined) = in_flight.join_next().await {
            settle(joined, &state);
        }
    }
}

fn settle(joined: Result<(), JoinError>, state: &AgentState) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(error = %e, "Fetch job panicked");
        }
        state.decrement_backlog();
    }
}
