//! Short request/response exchanges with the relay: connect, register,
//! heartbeat and path operations

use crate::error::{empty_agent_id, empty_path, AgentError};
use crate::metrics::{labels, AgentMetrics};
use crate::session::ProxySession;
use crate::state::{AgentState, LifecycleState, StartGate};
use scrapelink_proto::{
    Code, HeartBeatRequest, PathMapSizeRequest, RegisterAgentRequest, RegisterPathRequest,
    RegisterPathResponse, Status, UnregisterPathRequest, UnregisterPathResponse,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ProxyLifecycle {
    session: Arc<ProxySession>,
    state: Arc<AgentState>,
    metrics: Arc<AgentMetrics>,
    transport_filter_disabled: bool,
    consolidated: bool,
    call_timeout: Duration,
}

impl ProxyLifecycle {
    pub fn new(
        session: Arc<ProxySession>,
        state: Arc<AgentState>,
        metrics: Arc<AgentMetrics>,
        transport_filter_disabled: bool,
        consolidated: bool,
        call_timeout: Duration,
    ) -> Self {
        Self {
            session,
            state,
            metrics,
            transport_filter_disabled,
            consolidated,
            call_timeout,
        }
    }

    fn require_agent_id(&self) -> Result<String, AgentError> {
        let agent_id = self.state.agent_id();
        if agent_id.is_empty() {
            return Err(empty_agent_id());
        }
        Ok(agent_id)
    }

    async fn bounded<T>(
        &self,
        method: &'static str,
        call: impl Future<Output = Result<T, Status>>,
    ) -> Result<T, AgentError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Status::new(
                Code::DeadlineExceeded,
                format!("{} timed out after {:?}", method, self.call_timeout),
            )
            .into()),
        }
    }

    /// Handshake with the relay; never fails, reports success as a bool
    pub async fn connect_agent(&self) -> bool {
        self.state.transition(LifecycleState::Connecting);

        let result = self.try_connect_agent().await;
        match result {
            Ok(agent_id) => {
                info!(
                    proxy = %self.session.proxy_host(),
                    agent_id = %agent_id,
                    tls = self.session.target().tls.desc(),
                    "Connected to proxy"
                );
                self.metrics.record_connect(labels::SUCCESS);
                self.state.transition(LifecycleState::Connected);
                true
            }
            Err(e) => {
                info!(
                    proxy = %self.session.proxy_host(),
                    error = %e,
                    "Cannot connect to proxy"
                );
                self.metrics.record_connect(labels::FAILURE);
                self.state.transition(LifecycleState::Disconnected);
                false
            }
        }
    }

    async fn try_connect_agent(&self) -> Result<String, AgentError> {
        let service = self.session.service().await?;

        let response = if self.transport_filter_disabled {
            self.bounded(
                "connectAgentWithTransportFilterDisabled",
                service.connect_agent_with_transport_filter_disabled(),
            )
            .await?
        } else {
            self.bounded("connectAgent", service.connect_agent()).await?
        };

        if !response.agent_id.is_empty() {
            self.state.assign_agent_id(&response.agent_id)?;
        }
        self.state.mark_msg_sent();
        Ok(self.state.agent_id())
    }

    /// Register this agent; opens `gate` on success
    pub async fn register_agent(&self, gate: &StartGate) -> Result<(), AgentError> {
        let agent_id = self.require_agent_id()?;
        let request = RegisterAgentRequest {
            agent_id: agent_id.clone(),
            launch_id: self.state.launch_id().to_string(),
            agent_name: self.state.agent_name().to_string(),
            host_name: self.state.host_name().to_string(),
            consolidated: self.consolidated,
        };

        let service = self.session.service().await?;
        let response = self
            .bounded("registerAgent", service.register_agent(request))
            .await?;
        self.state.mark_msg_sent();

        if !response.valid {
            error!(agent_id = %agent_id, reason = %response.reason, "registerAgent() rejected");
            return Err(AgentError::Rejected {
                operation: "registerAgent",
                reason: response.reason,
            });
        }

        info!(
            agent_id = %agent_id,
            agent_name = %self.state.agent_name(),
            launch_id = %self.state.launch_id(),
            "Agent registered"
        );
        self.state.transition(LifecycleState::Registered);
        gate.open();
        Ok(())
    }

    /// Number of paths the relay holds for this agent
    pub async fn path_map_size(&self) -> Result<u32, AgentError> {
        let agent_id = self.require_agent_id()?;
        let service = self.session.service().await?;
        let response = self
            .bounded("pathMapSize", service.path_map_size(PathMapSizeRequest { agent_id }))
            .await?;
        self.state.mark_msg_sent();
        Ok(response.path_count)
    }

    pub async fn register_path_on_proxy(
        &self,
        path: &str,
    ) -> Result<RegisterPathResponse, AgentError> {
        if path.is_empty() {
            return Err(empty_path());
        }
        let agent_id = self.require_agent_id()?;
        let request = RegisterPathRequest {
            agent_id,
            path: path.to_string(),
        };

        let service = self.session.service().await?;
        let response = self
            .bounded("registerPath", service.register_path(request))
            .await?;
        self.state.mark_msg_sent();

        if !response.valid {
            return Err(AgentError::Rejected {
                operation: "registerPath",
                reason: response.reason,
            });
        }
        Ok(response)
    }

    pub async fn unregister_path_on_proxy(
        &self,
        path: &str,
    ) -> Result<UnregisterPathResponse, AgentError> {
        if path.is_empty() {
            return Err(empty_path());
        }
        let agent_id = self.require_agent_id()?;
        let request = UnregisterPathRequest {
            agent_id,
            path: path.to_string(),
        };

        let service = self.session.service().await?;
        let response = self
            .bounded("unregisterPath", service.unregister_path(request))
            .await?;
        self.state.mark_msg_sent();

        if !response.valid {
            return Err(AgentError::Rejected {
                operation: "unregisterPath",
                reason: response.reason,
            });
        }
        Ok(response)
    }

    /// Best-effort liveness signal
    ///
    /// Only an empty agent id is reported back; every relay or transport
    /// failure is logged here and absorbed.
    pub async fn send_heart_beat(&self) -> Result<(), AgentError> {
        let agent_id = self.require_agent_id()?;

        let result = async {
            let service = self.session.service().await?;
            self.bounded(
                "sendHeartBeat",
                service.send_heart_beat(HeartBeatRequest {
                    agent_id: agent_id.clone(),
                }),
            )
            .await
        }
        .await;

        match result {
            Ok(response) if response.valid => {
                debug!(agent_id = %agent_id, "Heartbeat acknowledged");
                self.state.mark_msg_sent();
            }
            Ok(response) => {
                self.state.mark_msg_sent();
                error!(
                    agent_id = %agent_id,
                    reason = %response.reason,
                    "AgentId not found on proxy, heartbeat rejected"
                );
            }
            Err(AgentError::Rpc(status)) => {
                warn!(
                    agent_id = %agent_id,
                    code = %status.code,
                    description = %status.message,
                    "Heartbeat failed"
                );
            }
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Heartbeat failed"),
        }
        Ok(())
    }
}
