//! Framed call stream

use futures::{SinkExt, StreamExt};
use scrapelink_proto::{ClientFrame, FrameCodec, ServerFrame, Status};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;

/// Byte stream a call runs over (plain TCP or TLS)
pub trait CallIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> CallIo for T {}

pub(crate) type BoxedIo = Box<dyn CallIo>;

/// One call's stream to the relay
///
/// Holds a tracker token so the owning channel can wait for in-flight calls
/// on shutdown, and observes the channel's cancellation token so a forced
/// shutdown aborts any pending read or write.
pub struct RpcStream {
    framed: Framed<BoxedIo, FrameCodec<ClientFrame, ServerFrame>>,
    cancel: CancellationToken,
    method: &'static str,
    _token: TaskTrackerToken,
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("method", &self.method)
            .finish()
    }
}

impl RpcStream {
    pub(crate) fn new(
        io: BoxedIo,
        cancel: CancellationToken,
        method: &'static str,
        token: TaskTrackerToken,
    ) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
            cancel,
            method,
            _token: token,
        }
    }

    /// Method this stream was opened for
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Write one frame
    pub async fn send(&mut self, frame: ClientFrame) -> Result<(), Status> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Status::cancelled(format!("{} cancelled by channel shutdown", self.method)))
            }
            result = self.framed.send(frame) => result.map_err(|e| {
                Status::unavailable(format!("{} write failed: {}", self.method, e))
            }),
        }
    }

    /// Read one frame; `None` when the relay closed the stream
    pub async fn recv(&mut self) -> Result<Option<ServerFrame>, Status> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Status::cancelled(format!("{} cancelled by channel shutdown", self.method)))
            }
            next = self.framed.next() => match next {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(Status::unavailable(format!(
                    "{} read failed: {}",
                    self.method, e
                ))),
                None => Ok(None),
            }
        }
    }

    /// Token cancelled by the channel's forced shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
