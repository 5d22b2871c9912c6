use crate::chunker::ResultEncoder;
use crate::config::AgentConfig;
use crate::context::ConnectionContext;
use crate::dispatch::ResponseDispatcher;
use crate::error::AgentError;
use crate::fetch::{run_fetch_jobs, ScrapeFetcher};
use crate::heartbeat::run_heartbeat;
use crate::intake::RequestIntake;
use crate::lifecycle::ProxyLifecycle;
use crate::metrics::{AgentMetrics, MetricSample};
use crate::paths::PathTable;
use crate::service::{AgentIdInterceptor, ProxyConnector, RpcConnector};
use crate::session::ProxySession;
use crate::state::{AgentState, LifecycleState, StartGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The scrape agent - keeps a connection to the relay and serves its requests
pub struct Agent {
    config: AgentConfig,

    state: Arc<AgentState>,
    metrics: Arc<AgentMetrics>,

    session: Arc<ProxySession>,
    lifecycle: Arc<ProxyLifecycle>,
    intake: Arc<RequestIntake>,
    dispatcher: ResponseDispatcher,

    /// Opened by the first successful registration
    start_gate: StartGate,

    /// Paths the relay accepted, shared with the fetcher
    paths: Arc<PathTable>,

    /// Context of the connection currently being served
    active_context: Mutex<Option<Arc<ConnectionContext>>>,

    stopped: CancellationToken,
}

impl Agent {
    /// Create an agent talking to the relay over [`RpcConnector`]
    ///
    /// `paths` is kept in step with the relay's registrations; hand the same
    /// table to the fetcher so it serves exactly the registered paths.
    pub fn new(
        config: AgentConfig,
        paths: Arc<PathTable>,
        fetcher: Arc<dyn ScrapeFetcher>,
        metrics: Arc<AgentMetrics>,
    ) -> Result<Self, AgentError> {
        let state = Arc::new(AgentState::new(metrics.launch_id(), &config.agent_name));
        let interceptor = (!config.transport_filter_disabled)
            .then(|| AgentIdInterceptor::new(state.clone()));
        let connector = Arc::new(RpcConnector::new(config.channel_options(), interceptor));
        Self::build(config, paths, fetcher, metrics, state, connector)
    }

    /// Create an agent with a custom connector
    pub fn with_connector(
        config: AgentConfig,
        paths: Arc<PathTable>,
        fetcher: Arc<dyn ScrapeFetcher>,
        metrics: Arc<AgentMetrics>,
        connector: Arc<dyn ProxyConnector>,
    ) -> Result<Self, AgentError> {
        let state = Arc::new(AgentState::new(metrics.launch_id(), &config.agent_name));
        Self::build(config, paths, fetcher, metrics, state, connector)
    }

    fn build(
        config: AgentConfig,
        paths: Arc<PathTable>,
        fetcher: Arc<dyn ScrapeFetcher>,
        metrics: Arc<AgentMetrics>,
        state: Arc<AgentState>,
        connector: Arc<dyn ProxyConnector>,
    ) -> Result<Self, AgentError> {
        config.validate()?;

        let session = Arc::new(ProxySession::new(&config, connector)?);
        let lifecycle = Arc::new(ProxyLifecycle::new(
            session.clone(),
            state.clone(),
            metrics.clone(),
            config.transport_filter_disabled,
            config.consolidated,
            config.call_timeout,
        ));
        let intake = Arc::new(RequestIntake::new(session.clone(), state.clone(), fetcher));
        let dispatcher = ResponseDispatcher::new(
            session.clone(),
            state.clone(),
            metrics.clone(),
            ResultEncoder::new(config.chunk_size_bytes()),
        );

        Ok(Self {
            config,
            state,
            metrics,
            session,
            lifecycle,
            intake,
            dispatcher,
            start_gate: StartGate::new(),
            paths,
            active_context: Mutex::new(None),
            stopped: CancellationToken::new(),
        })
    }

    /// Connect, serve, and reconnect until [`Agent::stop`] is called
    pub async fn run(&self) -> Result<(), AgentError> {
        if self.state.set_running(true) {
            return Err(AgentError::AlreadyRunning);
        }

        tracing::info!(
            agent_name = %self.state.agent_name(),
            launch_id = %self.state.launch_id(),
            proxy = %self.session.proxy_host(),
            "Starting agent"
        );

        if let Err(e) = self.session.reset_connection().await {
            self.state.set_running(false);
            return Err(e);
        }

        while self.state.is_running() {
            match self.connect_to_proxy().await {
                Ok(()) => {}
                Err(e) if e.is_rejection() => {
                    tracing::info!(
                        proxy = %self.session.proxy_host(),
                        reason = %e,
                        "Disconnecting from proxy after invalid response"
                    );
                }
                Err(e) => {
                    tracing::info!(
                        proxy = %self.session.proxy_host(),
                        error = %e,
                        "Disconnected from proxy"
                    );
                }
            }
            self.state.transition(LifecycleState::Disconnected);

            if !self.state.is_running() {
                break;
            }

            tracing::info!(
                pause_secs = self.config.reconnect_pause.as_secs_f64(),
                "Waiting to reconnect"
            );
            tokio::select! {
                _ = self.stopped.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_pause) => {}
            }
        }

        self.session.shut_down().await;
        tracing::info!(launch_id = %self.state.launch_id(), "Agent stopped");
        Ok(())
    }

    /// One connection cycle: handshake, registration, then serve until the
    /// connection ends
    pub async fn connect_to_proxy(&self) -> Result<(), AgentError> {
        // A previous cycle got as far as an agent id: start from a fresh handle
        if !self.state.agent_id().is_empty() {
            self.session.reset_connection().await?;
        }
        self.state.clear_agent_id();
        self.state.reset_backlog();

        if !self.lifecycle.connect_agent().await {
            return Ok(());
        }

        self.lifecycle.register_agent(&self.start_gate).await?;
        self.register_configured_paths().await?;

        let context = Arc::new(ConnectionContext::new());
        *self.active_context.lock().await = Some(context.clone());
        if !self.state.is_running() {
            context.release();
        }

        let result = self.serve(&context).await;

        *self.active_context.lock().await = None;
        result
    }

    async fn serve(&self, context: &Arc<ConnectionContext>) -> Result<(), AgentError> {
        let (jobs, results) = context
            .take_fetch_queues()
            .ok_or(AgentError::ContextReleased)?;

        let heartbeat = if self.config.heartbeat_enabled {
            Some(tokio::spawn(run_heartbeat(
                self.lifecycle.clone(),
                self.state.clone(),
                context.clone(),
                self.config.heartbeat_check_pause,
                self.config.heartbeat_max_inactivity,
            )))
        } else {
            tracing::info!("Heartbeat disabled");
            None
        };

        let worker = tokio::spawn(run_fetch_jobs(
            jobs,
            results,
            self.state.clone(),
            self.config.in_flight_drain_timeout,
        ));

        let intake = {
            let intake = self.intake.clone();
            let state = self.state.clone();
            let context = context.clone();
            tokio::spawn(async move {
                if let Err(e) = intake.read_requests_from_proxy(&context).await {
                    log_call_failure("readRequestsFromProxy", &state, &e);
                }
            })
        };

        self.state.transition(LifecycleState::Active);
        let dispatched = self
            .dispatcher
            .write_responses_to_proxy_until_disconnected(context)
            .await;

        context.release();
        for (name, task) in [("intake", intake), ("fetch worker", worker)] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "Connection task failed");
            }
        }
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }

        dispatched
    }

    async fn register_configured_paths(&self) -> Result<(), AgentError> {
        for entry in &self.config.paths {
            self.register_path(&entry.path, &entry.url).await?;
        }

        // Paths added at runtime in an earlier cycle
        let extra = self.paths.entries().into_iter().filter(|(path, _)| {
            !self
                .config
                .paths
                .iter()
                .any(|entry| entry.path.trim_start_matches('/') == path.as_str())
        });
        for (path, url) in extra {
            self.register_path(&path, &url).await?;
        }
        Ok(())
    }

    /// Register `path` with the relay and remember its url
    pub async fn register_path(&self, path: &str, url: &str) -> Result<(), AgentError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let response = self.lifecycle.register_path_on_proxy(path).await?;

        self.paths.insert(path, url);

        tracing::info!(
            path = %path,
            url = %url,
            path_id = response.path_id,
            path_count = response.path_count,
            "Registered path"
        );
        Ok(())
    }

    pub async fn unregister_path(&self, path: &str) -> Result<(), AgentError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let result = self.lifecycle.unregister_path_on_proxy(path).await;

        // The path is forgotten locally even when the relay did not know it
        let removed = self.paths.remove(path);
        result?;

        tracing::info!(path = %path, known = removed.is_some(), "Unregistered path");
        Ok(())
    }

    /// Relay's count of paths registered for this agent
    pub async fn path_map_size(&self) -> Result<u32, AgentError> {
        self.lifecycle.path_map_size().await
    }

    /// Registered paths, sorted
    pub async fn registered_paths(&self) -> Vec<(String, String)> {
        self.paths.entries()
    }

    pub fn path_table(&self) -> &Arc<PathTable> {
        &self.paths
    }

    /// Wait until the agent registered with the relay
    pub async fn await_initial_connection(&self, timeout: Duration) -> bool {
        self.start_gate.wait_timeout(timeout).await
    }

    /// Stop the agent gracefully
    pub async fn stop(&self) {
        tracing::info!(agent_id = %self.state.agent_id(), "Stopping agent");

        self.state.set_running(false);
        self.stopped.cancel();

        if let Some(context) = self.active_context.lock().await.as_ref() {
            context.release();
        }
        self.session.shut_down().await;
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Relay-assigned id of the current connection, empty when not connected
    pub fn agent_id(&self) -> String {
        self.state.agent_id()
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    /// Metric samples plus the current scrape queue size
    pub fn metrics_snapshot(&self) -> Vec<MetricSample> {
        let mut samples = self.metrics.snapshot();
        samples.push(MetricSample {
            name: "agent_scrape_queue_size",
            launch_id: self.state.launch_id().to_string(),
            label: String::new(),
            value: self.state.scrape_backlog().max(0) as u64,
        });
        samples
    }

    pub fn session(&self) -> &Arc<ProxySession> {
        &self.session
    }
}

fn log_call_failure(method: &'static str, state: &AgentState, error: &AgentError) {
    if !state.is_running() {
        tracing::debug!(method = method, error = %error, "Call ended while stopping");
        return;
    }
    match error.status() {
        Some(status) => tracing::error!(
            method = method,
            code = %status.code,
            description = %status.message,
            "Error in {}()", method
        ),
        None => tracing::error!(method = method, error = %error, "Error in {}()", method),
    }
}
