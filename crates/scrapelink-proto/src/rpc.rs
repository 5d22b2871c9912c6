//! RPC envelope frames
//!
//! Every logical call runs on its own transport stream. The agent opens the
//! stream with [`ClientFrame::Call`]; what follows depends on the call shape:
//!
//! - unary: the relay answers with one [`ServerFrame::Reply`] or [`ServerFrame::Status`]
//! - server streaming: zero or more [`ServerFrame::Request`] then a terminal `Status`
//! - client streaming: the agent sends payload frames then [`ClientFrame::HalfClose`],
//!   the relay answers like a unary call

use crate::messages::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata key carrying the relay-assigned agent id
pub const AGENT_ID_KEY: &str = "agent-id";

/// Ordered call metadata (header pairs)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Calls the agent can make on the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxyCall {
    ConnectAgent,
    ConnectAgentWithTransportFilterDisabled,
    RegisterAgent(RegisterAgentRequest),
    PathMapSize(PathMapSizeRequest),
    RegisterPath(RegisterPathRequest),
    UnregisterPath(UnregisterPathRequest),
    SendHeartBeat(HeartBeatRequest),
    ReadRequestsFromProxy(AgentInfo),
    WriteResponsesToProxy,
    WriteChunkedResponsesToProxy,
}

impl ProxyCall {
    /// Method name, used in logs and status descriptions
    pub fn name(&self) -> &'static str {
        match self {
            ProxyCall::ConnectAgent => "connectAgent",
            ProxyCall::ConnectAgentWithTransportFilterDisabled => {
                "connectAgentWithTransportFilterDisabled"
            }
            ProxyCall::RegisterAgent(_) => "registerAgent",
            ProxyCall::PathMapSize(_) => "pathMapSize",
            ProxyCall::RegisterPath(_) => "registerPath",
            ProxyCall::UnregisterPath(_) => "unregisterPath",
            ProxyCall::SendHeartBeat(_) => "sendHeartBeat",
            ProxyCall::ReadRequestsFromProxy(_) => "readRequestsFromProxy",
            ProxyCall::WriteResponsesToProxy => "writeResponsesToProxy",
            ProxyCall::WriteChunkedResponsesToProxy => "writeChunkedResponsesToProxy",
        }
    }
}

/// Unary reply bodies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProxyReply {
    Empty,
    AgentConnected(ConnectAgentResponse),
    AgentRegistered(RegisterAgentResponse),
    PathMapSize(PathMapSizeResponse),
    PathRegistered(RegisterPathResponse),
    PathUnregistered(UnregisterPathResponse),
    HeartBeat(HeartBeatResponse),
}

/// Frames written by the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientFrame {
    Call { metadata: Metadata, call: ProxyCall },
    Response(ScrapeResponse),
    Chunked(ChunkedScrapeResponse),
    HalfClose,
}

/// Frames written by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerFrame {
    Reply { metadata: Metadata, reply: ProxyReply },
    Request(ScrapeRequest),
    Status(Status),
}

/// Call status codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// Outcome of a call, carried on the wire and used as the client-side error type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}
