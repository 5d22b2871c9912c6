//! Inbound scrape requests

use crate::context::ConnectionContext;
use crate::error::{empty_agent_id, AgentError};
use crate::fetch::{FetchJob, ScrapeFetcher};
use crate::session::ProxySession;
use crate::state::AgentState;
use futures::StreamExt;
use scrapelink_proto::AgentInfo;
use std::sync::Arc;
use tracing::{debug, info};

/// Reads the relay's request stream and turns each request into a fetch job
pub struct RequestIntake {
    session: Arc<ProxySession>,
    state: Arc<AgentState>,
    fetcher: Arc<dyn ScrapeFetcher>,
}

impl RequestIntake {
    pub fn new(
        session: Arc<ProxySession>,
        state: Arc<AgentState>,
        fetcher: Arc<dyn ScrapeFetcher>,
    ) -> Self {
        Self {
            session,
            state,
            fetcher,
        }
    }

    /// Run until the relay ends the stream or `context` is released
    ///
    /// The context is released on return, whatever the outcome.
    pub async fn read_requests_from_proxy(
        &self,
        context: &ConnectionContext,
    ) -> Result<(), AgentError> {
        let _release = context.release_on_drop();

        let agent_id = self.state.agent_id();
        if agent_id.is_empty() {
            return Err(empty_agent_id());
        }

        let service = self.session.service().await?;
        let mut requests = service
            .read_requests_from_proxy(AgentInfo {
                agent_id: agent_id.clone(),
            })
            .await?;

        loop {
            let next = tokio::select! {
                _ = context.released() => {
                    debug!(agent_id = %agent_id, "Connection released, no longer reading requests");
                    return Ok(());
                }
                next = requests.next() => next,
            };

            match next {
                Some(Ok(request)) => {
                    debug!(
                        agent_id = %agent_id,
                        scrape_id = request.scrape_id,
                        path = %request.path,
                        "Scrape request received"
                    );
                    self.state.increment_backlog();
                    if let Err(e) = context.submit(FetchJob::new(request, self.fetcher.clone())) {
                        self.state.decrement_backlog();
                        return Err(e);
                    }
                }
                Some(Err(status)) => return Err(status.into()),
                None => {
                    info!(agent_id = %agent_id, "Proxy closed the request stream");
                    return Ok(());
                }
            }
        }
    }
}
