//! RPC surface of the relay
//!
//! [`ProxyService`] is the logical call set the agent uses. [`RpcProxyClient`]
//! implements it over an [`RpcChannel`]; [`ProxyConnector`] builds a fresh
//! service for a target and is what a session reset goes through.

use crate::error::AgentError;
use crate::state::AgentState;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use scrapelink_proto::{
    AgentInfo, ChunkedScrapeResponse, ClientFrame, ConnectAgentResponse, HeartBeatRequest,
    HeartBeatResponse, Metadata, PathMapSizeRequest, PathMapSizeResponse, ProxyCall, ProxyReply,
    RegisterAgentRequest, RegisterAgentResponse, RegisterPathRequest, RegisterPathResponse,
    ScrapeRequest, ScrapeResponse, Status, UnregisterPathRequest, UnregisterPathResponse,
    AGENT_ID_KEY,
};
use scrapelink_transport::{ChannelOptions, ChannelTarget, RpcChannel};
use std::sync::Arc;
use std::time::Duration;

pub type ScrapeRequestStream = BoxStream<'static, Result<ScrapeRequest, Status>>;

/// Calls the agent makes on the relay
#[async_trait]
pub trait ProxyService: Send + Sync {
    async fn connect_agent(&self) -> Result<ConnectAgentResponse, Status>;

    async fn connect_agent_with_transport_filter_disabled(
        &self,
    ) -> Result<ConnectAgentResponse, Status>;

    async fn register_agent(
        &self,
        request: RegisterAgentRequest,
    ) -> Result<RegisterAgentResponse, Status>;

    async fn path_map_size(&self, request: PathMapSizeRequest)
        -> Result<PathMapSizeResponse, Status>;

    async fn register_path(
        &self,
        request: RegisterPathRequest,
    ) -> Result<RegisterPathResponse, Status>;

    async fn unregister_path(
        &self,
        request: UnregisterPathRequest,
    ) -> Result<UnregisterPathResponse, Status>;

    async fn send_heart_beat(&self, request: HeartBeatRequest)
        -> Result<HeartBeatResponse, Status>;

    /// Server-streaming call delivering the relay's scrape requests
    async fn read_requests_from_proxy(
        &self,
        info: AgentInfo,
    ) -> Result<ScrapeRequestStream, Status>;

    /// Client-streaming call; returns once `responses` ends and the relay replied
    async fn write_responses_to_proxy(
        &self,
        responses: BoxStream<'static, ScrapeResponse>,
    ) -> Result<(), Status>;

    async fn write_chunked_responses_to_proxy(
        &self,
        frames: BoxStream<'static, ChunkedScrapeResponse>,
    ) -> Result<(), Status>;

    /// Release transport resources: refuse new calls, give in-flight calls
    /// `grace`, then cancel them
    async fn shutdown(&self, grace: Duration);
}

/// Builds a service bound to a target
pub trait ProxyConnector: Send + Sync {
    fn connect(&self, target: &ChannelTarget) -> Result<Arc<dyn ProxyService>, AgentError>;
}

/// Attaches the relay-assigned agent id to outgoing calls
#[derive(Clone)]
pub struct AgentIdInterceptor {
    state: Arc<AgentState>,
}

impl AgentIdInterceptor {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    fn outgoing(&self) -> Metadata {
        let mut metadata = Metadata::new();
        let agent_id = self.state.agent_id();
        if !agent_id.is_empty() {
            metadata.insert(AGENT_ID_KEY, agent_id);
        }
        metadata
    }
}

/// [`ProxyService`] over an [`RpcChannel`]
pub struct RpcProxyClient {
    channel: RpcChannel,
    interceptor: Option<AgentIdInterceptor>,
}

impl RpcProxyClient {
    pub fn new(channel: RpcChannel, interceptor: Option<AgentIdInterceptor>) -> Self {
        Self {
            channel,
            interceptor,
        }
    }

    fn metadata(&self) -> Metadata {
        self.interceptor
            .as_ref()
            .map(AgentIdInterceptor::outgoing)
            .unwrap_or_default()
    }

    async fn unary(&self, call: ProxyCall) -> Result<(Metadata, ProxyReply), Status> {
        self.channel.unary(self.metadata(), call).await
    }
}

fn unexpected_reply(method: &str, reply: &ProxyReply) -> Status {
    Status::internal(format!("{} got unexpected reply {:?}", method, reply))
}

#[async_trait]
impl ProxyService for RpcProxyClient {
    async fn connect_agent(&self) -> Result<ConnectAgentResponse, Status> {
        let (metadata, reply) = self.unary(ProxyCall::ConnectAgent).await?;
        match reply {
            ProxyReply::Empty | ProxyReply::AgentConnected(_) => Ok(ConnectAgentResponse {
                agent_id: metadata.get(AGENT_ID_KEY).unwrap_or_default().to_string(),
            }),
            other => Err(unexpected_reply("connectAgent", &other)),
        }
    }

    async fn connect_agent_with_transport_filter_disabled(
        &self,
    ) -> Result<ConnectAgentResponse, Status> {
        match self
            .unary(ProxyCall::ConnectAgentWithTransportFilterDisabled)
            .await?
        {
            (_, ProxyReply::AgentConnected(response)) => Ok(response),
            (_, other) => Err(unexpected_reply(
                "connectAgentWithTransportFilterDisabled",
                &other,
            )),
        }
    }

    async fn register_agent(
        &self,
        request: RegisterAgentRequest,
    ) -> Result<RegisterAgentResponse, Status> {
        match self.unary(ProxyCall::RegisterAgent(request)).await? {
            (_, ProxyReply::AgentRegistered(response)) => Ok(response),
            (_, other) => Err(unexpected_reply("registerAgent", &other)),
        }
    }

    async fn path_map_size(
        &self,
        request: PathMapSizeRequest,
    ) -> Result<PathMapSizeResponse, Status> {
        match self.unary(ProxyCall::PathMapSize(request)).await? {
            (_, ProxyReply::PathMapSize(response)) => Ok(response),
            (_, other) => Err(unexpected_reply("pathMapSize", &other)),
        }
    }

    async fn register_path(
        &self,
        request: RegisterPathRequest,
    ) -> Result<RegisterPathResponse, Status> {
        match self.unary(ProxyCall::RegisterPath(request)).await? {
            (_, ProxyReply::PathRegistered(response)) => Ok(response),
            (_, other) => Err(unexpected_reply("registerPath", &other)),
        }
    }

    async fn unregister_path(
        &self,
        request: UnregisterPathRequest,
    ) -> Result<UnregisterPathResponse, Status> {
        match self.unary(ProxyCall::UnregisterPath(request)).await? {
            (_, ProxyReply::PathUnregistered(response)) => Ok(response),
            (_, other) => Err(unexpected_reply("unregisterPath", &other)),
        }
    }

    async fn send_heart_beat(
        &self,
        request: HeartBeatRequest,
    ) -> Result<HeartBeatResponse, Status> {
        match self.unary(ProxyCall::SendHeartBeat(request)).await? {
            (_, ProxyReply::HeartBeat(response)) => Ok(response),
            (_, other) => Err(unexpected_reply("sendHeartBeat", &other)),
        }
    }

    async fn read_requests_from_proxy(
        &self,
        info: AgentInfo,
    ) -> Result<ScrapeRequestStream, Status> {
        self.channel
            .server_streaming(self.metadata(), ProxyCall::ReadRequestsFromProxy(info))
            .await
    }

    async fn write_responses_to_proxy(
        &self,
        responses: BoxStream<'static, ScrapeResponse>,
    ) -> Result<(), Status> {
        self.channel
            .client_streaming(
                self.metadata(),
                ProxyCall::WriteResponsesToProxy,
                responses.map(ClientFrame::Response).boxed(),
            )
            .await
            .map(|_| ())
    }

    async fn write_chunked_responses_to_proxy(
        &self,
        frames: BoxStream<'static, ChunkedScrapeResponse>,
    ) -> Result<(), Status> {
        self.channel
            .client_streaming(
                self.metadata(),
                ProxyCall::WriteChunkedResponsesToProxy,
                frames.map(ClientFrame::Chunked).boxed(),
            )
            .await
            .map(|_| ())
    }

    async fn shutdown(&self, grace: Duration) {
        self.channel.shutdown(grace).await
    }
}

/// Connector producing [`RpcProxyClient`]s
pub struct RpcConnector {
    options: ChannelOptions,
    interceptor: Option<AgentIdInterceptor>,
}

impl RpcConnector {
    /// With `interceptor` set, every call carries the `agent-id` metadata
    pub fn new(options: ChannelOptions, interceptor: Option<AgentIdInterceptor>) -> Self {
        Self {
            options,
            interceptor,
        }
    }
}

impl ProxyConnector for RpcConnector {
    fn connect(&self, target: &ChannelTarget) -> Result<Arc<dyn ProxyService>, AgentError> {
        let channel = RpcChannel::new(target.clone(), self.options.clone())?;
        Ok(Arc::new(RpcProxyClient::new(
            channel,
            self.interceptor.clone(),
        )))
    }
}
