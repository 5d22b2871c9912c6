use crate::context::ConnectionContext;
use crate::lifecycle::ProxyLifecycle;
use crate::state::AgentState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Send a heartbeat whenever nothing was sent for `max_inactivity`,
/// checking every `check_pause`, until `context` is released
pub async fn run_heartbeat(
    lifecycle: Arc<ProxyLifecycle>,
    state: Arc<AgentState>,
    context: Arc<ConnectionContext>,
    check_pause: Duration,
    max_inactivity: Duration,
) {
    info!(
        check_pause_ms = check_pause.as_millis() as u64,
        max_inactivity_secs = max_inactivity.as_secs(),
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            _ = context.released() => break,
            _ = tokio::time::sleep(check_pause) => {}
        }

        if state.since_last_msg_sent() <= max_inactivity {
            continue;
        }

        if let Err(e) = lifecycle.send_heart_beat().await {
            warn!(error = %e, "Heartbeat not sent");
        }
    }

    info!("Heartbeat completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metrics::AgentMetrics;
    use crate::session::ProxySession;
    use crate::test_support::{MockConnector, MockProxy};

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_after_inactivity() {
        let proxy = MockProxy::new("17");
        let session = Arc::new(
            ProxySession::connect(&AgentConfig::default(), MockConnector::new(proxy.clone()))
                .await
                .unwrap(),
        );
        let state = Arc::new(AgentState::new("launch-1", "edge"));
        state.assign_agent_id("17").unwrap();
        let lifecycle = Arc::new(ProxyLifecycle::new(
            session,
            state.clone(),
            Arc::new(AgentMetrics::with_launch_id("launch-1")),
            false,
            false,
            Duration::from_secs(1),
        ));
        state.mark_msg_sent();

        let context = Arc::new(ConnectionContext::new());
        let heartbeat = tokio::spawn(run_heartbeat(
            lifecycle,
            state.clone(),
            context.clone(),
            Duration::from_millis(500),
            Duration::from_secs(5),
        ));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(proxy.heartbeats(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(proxy.heartbeats(), 1);

        // A heartbeat counts as traffic, so the next one waits another interval
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(proxy.heartbeats(), 1);

        context.release();
        heartbeat.await.unwrap();
    }
}
