use scrapelink_proto::Status;
use scrapelink_transport::TransportError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Caller supplied an empty agent id or path; nothing was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The relay answered `valid=false`
    #[error("{operation}() rejected by proxy: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("RPC failed: {0}")]
    Rpc(#[from] Status),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid proxy address '{0}'")]
    Address(String),

    #[error("Chunked transmission invalid: {0}")]
    Codec(String),

    #[error("Not connected to proxy")]
    NotConnected,

    #[error("Connection context released")]
    ContextReleased,

    #[error("Outbound {0} queue closed")]
    QueueClosed(&'static str),

    #[error("Agent already running")]
    AlreadyRunning,
}

impl AgentError {
    /// True for `valid=false` replies from the relay
    pub fn is_rejection(&self) -> bool {
        matches!(self, AgentError::Rejected { .. })
    }

    /// Status code and description when the failure came from an RPC
    pub fn status(&self) -> Option<&Status> {
        match self {
            AgentError::Rpc(status) => Some(status),
            _ => None,
        }
    }
}

pub(crate) fn empty_agent_id() -> AgentError {
    AgentError::InvalidArgument("Empty agentId".to_string())
}

pub(crate) fn empty_path() -> AgentError {
    AgentError::InvalidArgument("Empty path".to_string())
}
