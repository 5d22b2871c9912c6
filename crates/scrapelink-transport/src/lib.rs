//! Transport layer for agent-to-relay calls
//!
//! An [`RpcChannel`] is the agent's connection handle to the relay. It holds
//! the resolved target and TLS credentials and opens one framed stream per
//! call, the way an RPC channel multiplexes calls over its transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        scrapelink-agent      │  lifecycle, intake, dispatch
//! └──────────────────────────────┘
//!                │ unary / server-streaming / client-streaming
//!                ↓
//! ┌──────────────────────────────┐
//! │  RpcChannel (this crate)     │  dial + retry, TLS, shutdown
//! └──────────────────────────────┘
//!                │ FrameCodec<ClientFrame, ServerFrame>
//!                ↓
//!          TCP  /  TLS over TCP
//! ```

// Initialize rustls crypto provider once globally
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            // Provider already installed by another crate, this is fine
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod channel;
pub mod stream;
pub mod tls;

pub use channel::{ChannelOptions, ChannelTarget, RpcChannel};
pub use stream::RpcStream;
pub use tls::{TlsMode, TlsSettings};

use scrapelink_proto::{CodecError, Status};
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Channel shut down")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ChannelClosed => Status::cancelled("channel shut down"),
            TransportError::Codec(e) => Status::internal(e.to_string()),
            other => Status::unavailable(other.to_string()),
        }
    }
}
