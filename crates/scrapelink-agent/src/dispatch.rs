//! Outbound results: the codec task and the two writer streams

use crate::chunker::{EncodedResult, ResultEncoder};
use crate::context::ConnectionContext;
use crate::error::AgentError;
use crate::fetch::ScrapeResult;
use crate::metrics::AgentMetrics;
use crate::session::ProxySession;
use crate::state::AgentState;
use futures::StreamExt;
use scrapelink_proto::{ChunkedScrapeResponse, ScrapeResponse, Status};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Senders of the plain and chunked outbound queues
///
/// Dropping this closes both queues, which ends both writer streams.
struct OutboundQueues {
    plain: mpsc::UnboundedSender<ScrapeResponse>,
    chunked: mpsc::UnboundedSender<ChunkedScrapeResponse>,
}

impl OutboundQueues {
    fn push(&self, encoded: EncodedResult) -> Result<(), AgentError> {
        match encoded {
            EncodedResult::Single { response, .. } => self
                .plain
                .send(response)
                .map_err(|_| AgentError::QueueClosed("plain")),
            EncodedResult::Chunked(frames) => {
                for frame in frames {
                    self.chunked
                        .send(frame)
                        .map_err(|_| AgentError::QueueClosed("chunked"))?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for OutboundQueues {
    fn drop(&mut self) {
        debug!("Closing outbound queues");
    }
}

/// Owns the outbound side of one connection
pub struct ResponseDispatcher {
    session: Arc<ProxySession>,
    state: Arc<AgentState>,
    metrics: Arc<AgentMetrics>,
    encoder: ResultEncoder,
}

impl ResponseDispatcher {
    pub fn new(
        session: Arc<ProxySession>,
        state: Arc<AgentState>,
        metrics: Arc<AgentMetrics>,
        encoder: ResultEncoder,
    ) -> Self {
        Self {
            session,
            state,
            metrics,
            encoder,
        }
    }

    /// Run the codec task and both writers until the connection ends
    ///
    /// Returns the codec task's outcome once all three tasks finished. The
    /// context is released before returning.
    pub async fn write_responses_to_proxy_until_disconnected(
        &self,
        context: &Arc<ConnectionContext>,
    ) -> Result<(), AgentError> {
        let _release = context.release_on_drop();

        let results = context.take_results().ok_or(AgentError::ContextReleased)?;
        let service = self.session.service().await?;

        let (plain_tx, plain_rx) = mpsc::unbounded_channel();
        let (chunked_tx, chunked_rx) = mpsc::unbounded_channel();
        let queues = OutboundQueues {
            plain: plain_tx,
            chunked: chunked_tx,
        };

        let codec = tokio::spawn(process_scrape_results(
            self.encoder,
            self.state.clone(),
            self.metrics.clone(),
            results,
            queues,
            context.clone(),
        ));

        let plain_writer = {
            let service = service.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                let result = service
                    .write_responses_to_proxy(UnboundedReceiverStream::new(plain_rx).boxed())
                    .await;
                log_writer_outcome("writeResponsesToProxy", &state, result);
            })
        };

        let chunked_writer = {
            let service = service.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                let result = service
                    .write_chunked_responses_to_proxy(
                        UnboundedReceiverStream::new(chunked_rx).boxed(),
                    )
                    .await;
                log_writer_outcome("writeChunkedResponsesToProxy", &state, result);
            })
        };

        let (plain, chunked) = tokio::join!(plain_writer, chunked_writer);
        for (method, joined) in [
            ("writeResponsesToProxy", plain),
            ("writeChunkedResponsesToProxy", chunked),
        ] {
            if let Err(e) = joined {
                warn!(method = method, error = %e, "Writer task failed");
            }
        }
        // Both writers are gone: nothing more can reach the relay
        context.release();

        match codec.await {
            Ok(result) => result,
            Err(e) => Err(AgentError::Codec(format!("codec task failed: {}", e))),
        }
    }
}

fn log_writer_outcome(method: &'static str, state: &AgentState, result: Result<(), Status>) {
    match result {
        Ok(()) => debug!(method = method, "Outbound stream completed"),
        Err(status) if state.is_running() => error!(
            method = method,
            code = %status.code,
            description = %status.message,
            "Error in {}()", method
        ),
        Err(status) => debug!(
            method = method,
            code = %status.code,
            "Outbound stream ended while stopping"
        ),
    }
}

/// Drain the result queue through the codec onto the outbound queues
///
/// Exits when the result queue closes, or on the first failed push, which
/// releases the connection. The outbound queues close when this returns.
async fn process_scrape_results(
    encoder: ResultEncoder,
    state: Arc<AgentState>,
    metrics: Arc<AgentMetrics>,
    mut results: mpsc::UnboundedReceiver<ScrapeResult>,
    queues: OutboundQueues,
    context: Arc<ConnectionContext>,
) -> Result<(), AgentError> {
    let outcome = loop {
        let result = match results.recv().await {
            Some(result) => result,
            None => break Ok(()),
        };

        let scrape_id = result.scrape_id;
        let encoded = encoder.encode(result);
        let label = encoded.outcome().label();
        let pushed = queues.push(encoded);
        state.decrement_backlog();

        match pushed {
            Ok(()) => {
                debug!(scrape_id = scrape_id, encoding = label, "Scrape result queued");
                metrics.record_scrape_result(label);
                state.mark_msg_sent();
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &outcome {
        if state.is_running() {
            error!(error = %e, "Scrape result processing failed");
        }
        context.release();

        // Whatever is still queued will never be sent
        results.close();
        while results.try_recv().is_ok() {
            state.decrement_backlog();
        }
    } else {
        info!("Scrape result queue closed");
    }

    drop(queues);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkedReassembler;
    use crate::config::AgentConfig;
    use crate::metrics::labels;
    use crate::test_support::{MockConnector, MockProxy};
    use bytes::Bytes;

    struct Fixture {
        proxy: Arc<MockProxy>,
        state: Arc<AgentState>,
        metrics: Arc<AgentMetrics>,
        dispatcher: ResponseDispatcher,
    }

    async fn fixture(chunk_size: usize) -> Fixture {
        let proxy = MockProxy::new("17");
        let session = Arc::new(
            ProxySession::connect(&AgentConfig::default(), MockConnector::new(proxy.clone()))
                .await
                .unwrap(),
        );
        let state = Arc::new(AgentState::new("launch-1", "edge"));
        state.set_running(true);
        let metrics = Arc::new(AgentMetrics::with_launch_id("launch-1"));
        let dispatcher = ResponseDispatcher::new(
            session,
            state.clone(),
            metrics.clone(),
            ResultEncoder::new(chunk_size),
        );
        Fixture {
            proxy,
            state,
            metrics,
            dispatcher,
        }
    }

    fn result(scrape_id: u64, zipped: bool, content: &[u8]) -> ScrapeResult {
        ScrapeResult {
            agent_id: "17".to_string(),
            scrape_id,
            valid_response: true,
            status_code: 200,
            zipped,
            content: Bytes::copy_from_slice(content),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_results_routed_by_encoding() {
        let f = fixture(4).await;
        let context = Arc::new(ConnectionContext::new());
        let (_jobs, results_tx) = context.take_fetch_queues().unwrap();

        for _ in 0..3 {
            f.state.increment_backlog();
        }
        results_tx.send(result(1, false, b"plain text body")).unwrap();
        results_tx.send(result(2, true, b"abc")).unwrap();
        results_tx.send(result(3, true, b"ABCDEFGHIJ")).unwrap();
        drop(results_tx);

        f.dispatcher
            .write_responses_to_proxy_until_disconnected(&context)
            .await
            .unwrap();

        let plain = f.proxy.responses();
        assert_eq!(plain.iter().map(|r| r.scrape_id).collect::<Vec<_>>(), vec![1, 2]);

        let mut reassembler = ChunkedReassembler::new();
        let mut rebuilt = None;
        for frame in f.proxy.chunked() {
            if let Some(done) = reassembler.push(frame).unwrap() {
                rebuilt = Some(done);
            }
        }
        let (header, payload) = rebuilt.unwrap();
        assert_eq!(header.scrape_id, 3);
        assert_eq!(payload, b"ABCDEFGHIJ".to_vec());

        assert_eq!(f.state.scrape_backlog(), 0);
        assert_eq!(f.state.sent_message_count(), 3);
        assert_eq!(f.metrics.scrape_result_count.get("launch-1", labels::NON_GZIPPED), 1);
        assert_eq!(f.metrics.scrape_result_count.get("launch-1", labels::GZIPPED), 1);
        assert_eq!(f.metrics.scrape_result_count.get("launch-1", labels::CHUNKED), 1);
        assert!(context.is_released());
    }

    #[tokio::test]
    async fn test_chunked_frames_not_interleaved() {
        let f = fixture(3).await;
        let context = Arc::new(ConnectionContext::new());
        let (_jobs, results_tx) = context.take_fetch_queues().unwrap();

        for id in 1..=4u64 {
            results_tx
                .send(result(id, true, format!("payload-{}-0123456789", id).as_bytes()))
                .unwrap();
        }
        drop(results_tx);

        f.dispatcher
            .write_responses_to_proxy_until_disconnected(&context)
            .await
            .unwrap();

        let mut reassembler = ChunkedReassembler::new();
        let mut completed = Vec::new();
        for frame in f.proxy.chunked() {
            if let Some((header, payload)) = reassembler.push(frame).unwrap() {
                let expected = format!("payload-{}-0123456789", header.scrape_id);
                assert_eq!(payload, expected.into_bytes());
                completed.push(header.scrape_id);
                reassembler = ChunkedReassembler::new();
            }
        }
        assert_eq!(completed, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_writer_failure_closes_both_queues() {
        let f = fixture(4).await;
        f.proxy.fail_plain_writes(Status::unavailable("stream reset"));

        let context = Arc::new(ConnectionContext::new());
        let (_jobs, results_tx) = context.take_fetch_queues().unwrap();

        let dispatch = {
            let context = context.clone();
            let dispatcher = f.dispatcher;
            tokio::spawn(async move {
                dispatcher
                    .write_responses_to_proxy_until_disconnected(&context)
                    .await
            })
        };

        f.state.increment_backlog();
        results_tx.send(result(1, true, b"ABCDEFGHIJ")).unwrap();

        // Plain writer has failed and dropped its queue
        while !f.proxy.calls().contains(&"writeResponsesToProxy") {
            tokio::task::yield_now().await;
        }

        f.state.increment_backlog();
        results_tx.send(result(2, false, b"plain")).unwrap();

        let outcome = dispatch.await.unwrap();
        assert!(matches!(outcome, Err(AgentError::QueueClosed("plain"))));
        assert!(context.is_released());

        // No partial transmission reached the relay
        let mut reassembler = ChunkedReassembler::new();
        let mut completed = 0;
        for frame in f.proxy.chunked() {
            if reassembler.push(frame).unwrap().is_some() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(f.state.scrape_backlog(), 0);
        assert!(results_tx.send(result(3, false, b"late")).is_err());
    }

    #[tokio::test]
    async fn test_crashed_writer_ends_dispatch() {
        let f = fixture(4).await;
        f.proxy.crash_chunked_writes();

        let context = Arc::new(ConnectionContext::new());
        let (_jobs, results_tx) = context.take_fetch_queues().unwrap();

        let dispatch = {
            let context = context.clone();
            let dispatcher = f.dispatcher;
            tokio::spawn(async move {
                dispatcher
                    .write_responses_to_proxy_until_disconnected(&context)
                    .await
            })
        };

        while !f.proxy.calls().contains(&"writeChunkedResponsesToProxy") {
            tokio::task::yield_now().await;
        }

        f.state.increment_backlog();
        results_tx.send(result(1, true, b"ABCDEFGHIJ")).unwrap();

        let outcome = dispatch.await.unwrap();
        assert!(matches!(outcome, Err(AgentError::QueueClosed("chunked"))));
        assert!(context.is_released());
        assert!(f.proxy.chunked().is_empty());
        assert_eq!(f.state.scrape_backlog(), 0);
    }

    #[tokio::test]
    async fn test_release_flushes_accepted_results() {
        let f = fixture(4).await;
        let context = Arc::new(ConnectionContext::new());
        let (_jobs, results_tx) = context.take_fetch_queues().unwrap();

        for id in 1..=3 {
            f.state.increment_backlog();
            results_tx.send(result(id, true, b"ABCDEFGHIJKLMNOP")).unwrap();
        }
        context.release();
        // The fetch worker drops its sender once its jobs drained
        drop(results_tx);

        f.dispatcher
            .write_responses_to_proxy_until_disconnected(&context)
            .await
            .unwrap();

        let mut reassembler = ChunkedReassembler::new();
        let mut completed = 0;
        for frame in f.proxy.chunked() {
            if reassembler.push(frame).unwrap().is_some() {
                completed += 1;
                reassembler = ChunkedReassembler::new();
            }
        }
        assert_eq!(completed, 3);
        assert_eq!(f.state.scrape_backlog(), 0);
    }
}
