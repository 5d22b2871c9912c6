//! Queues owned by one connection to the relay

use crate::error::AgentError;
use crate::fetch::{FetchJob, ScrapeResult};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type FetchQueues = (
    mpsc::UnboundedReceiver<FetchJob>,
    mpsc::UnboundedSender<ScrapeResult>,
);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Job and result queues of one connection
///
/// Releasing the context closes job acceptance and signals every task of
/// the connection. Jobs already accepted still run; the result queue closes
/// once the fetch worker lets go of its sender, and the dispatch codec closes
/// both outbound queues after it sees that.
pub struct ConnectionContext {
    jobs: Mutex<Option<mpsc::UnboundedSender<FetchJob>>>,
    fetch_queues: Mutex<Option<FetchQueues>>,
    results: Mutex<Option<mpsc::UnboundedReceiver<ScrapeResult>>>,
    released: CancellationToken,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionContext {
    pub fn new() -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            jobs: Mutex::new(Some(jobs_tx)),
            fetch_queues: Mutex::new(Some((jobs_rx, results_tx))),
            results: Mutex::new(Some(results_rx)),
            released: CancellationToken::new(),
        }
    }

    /// Queue a fetch job
    pub fn submit(&self, job: FetchJob) -> Result<(), AgentError> {
        let jobs = lock(&self.jobs);
        let sender = jobs.as_ref().ok_or(AgentError::ContextReleased)?;
        sender.send(job).map_err(|_| AgentError::ContextReleased)
    }

    /// Job receiver and result sender for the fetch worker; `None` once taken
    pub fn take_fetch_queues(&self) -> Option<FetchQueues> {
        lock(&self.fetch_queues).take()
    }

    /// Result receiver for the dispatch codec; `None` once taken
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<ScrapeResult>> {
        lock(&self.results).take()
    }

    /// Close job acceptance and signal release; idempotent
    pub fn release(&self) {
        let jobs = lock(&self.jobs).take();
        // Queues never handed to a worker would keep the result queue open
        let unclaimed = lock(&self.fetch_queues).take();

        if jobs.is_some() || unclaimed.is_some() {
            debug!("Connection context released");
        }
        drop(jobs);
        drop(unclaimed);
        self.released.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Resolves once the context is released
    pub async fn released(&self) {
        self.released.cancelled().await
    }

    /// Guard that releases the context when dropped
    pub fn release_on_drop(&self) -> ReleaseGuard<'_> {
        ReleaseGuard { context: self }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases its context on every exit path, including task cancellation
pub struct ReleaseGuard<'a> {
    context: &'a ConnectionContext,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.context.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ScrapeFetcher;
    use crate::test_support::StaticFetcher;
    use scrapelink_proto::ScrapeRequest;
    use std::sync::Arc;

    fn job(scrape_id: u64) -> FetchJob {
        let fetcher: Arc<dyn ScrapeFetcher> = Arc::new(StaticFetcher::new(b"ok".to_vec(), false));
        FetchJob::new(
            ScrapeRequest {
                scrape_id,
                ..Default::default()
            },
            fetcher,
        )
    }

    #[test]
    fn test_release_refuses_new_jobs() {
        let context = ConnectionContext::new();
        context.submit(job(1)).unwrap();

        context.release();
        context.release();
        assert!(context.is_released());
        assert!(matches!(
            context.submit(job(2)),
            Err(AgentError::ContextReleased)
        ));
    }

    #[tokio::test]
    async fn test_accepted_jobs_survive_release() {
        let context = ConnectionContext::new();
        let (mut jobs, _results) = context.take_fetch_queues().unwrap();
        assert!(context.take_fetch_queues().is_none());

        context.submit(job(1)).unwrap();
        context.release();

        assert_eq!(jobs.recv().await.map(|j| j.scrape_id()), Some(1));
        assert!(jobs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_release_closes_unclaimed_result_queue() {
        let context = ConnectionContext::new();
        let mut results = context.take_results().unwrap();

        context.release();
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let context = Arc::new(ConnectionContext::new());
        let (guarded_tx, guarded_rx) = tokio::sync::oneshot::channel();
        let task = {
            let context = context.clone();
            tokio::spawn(async move {
                let _release = context.release_on_drop();
                let _ = guarded_tx.send(());
                std::future::pending::<()>().await;
            })
        };

        guarded_rx.await.unwrap();
        assert!(!context.is_released());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::timeout(std::time::Duration::from_secs(5), context.released())
            .await
            .unwrap();
        assert!(context.is_released());
    }
}
