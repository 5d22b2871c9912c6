//! Scrapelink protocol definitions
//!
//! This crate defines the messages exchanged between a scrape agent and the
//! relay ("proxy"), the RPC envelope frames that carry them, and the
//! length-prefixed codec used on every transport stream.

pub mod codec;
pub mod messages;
pub mod rpc;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;
pub use rpc::{
    ClientFrame, Code, Metadata, ProxyCall, ProxyReply, ServerFrame, Status, AGENT_ID_KEY,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default relay port when an address carries none
pub const DEFAULT_PROXY_PORT: u16 = 50051;
