//! Connection handle to the relay

use crate::stream::{BoxedIo, RpcStream};
use crate::tls::TlsMode;
use crate::{TransportError, TransportResult};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use rustls::pki_types::ServerName;
use scrapelink_proto::{
    ClientFrame, Metadata, ProxyCall, ProxyReply, ScrapeRequest, ServerFrame, Status,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Where and how to reach the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    /// Name presented for TLS verification instead of `host`
    pub override_authority: Option<String>,
}

impl ChannelTarget {
    /// `host:port` form used in logs
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Dial behavior of a channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Dial attempts per call before the call fails
    pub connect_attempts: u32,
    /// Pause between failed dial attempts
    pub retry_backoff: Duration,
    /// Bound on a single TCP connect plus TLS handshake
    pub connect_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Channel to the relay
///
/// Dialing is lazy: each call opens its own stream. TLS credentials are
/// built when the channel is created so bad certificate material fails
/// there instead of on the first call.
pub struct RpcChannel {
    target: ChannelTarget,
    options: ChannelOptions,
    tls: Option<(tokio_rustls::TlsConnector, ServerName<'static>)>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("target", &self.target)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl RpcChannel {
    /// Create a channel for `target`
    pub fn new(target: ChannelTarget, options: ChannelOptions) -> TransportResult<Self> {
        if options.connect_attempts == 0 {
            return Err(TransportError::ConfigurationError(
                "Connect attempts must be > 0".to_string(),
            ));
        }

        let tls = match &target.tls {
            TlsMode::Plaintext => None,
            TlsMode::Tls(settings) => {
                let connector = settings.build_connector()?;
                let name = target
                    .override_authority
                    .clone()
                    .unwrap_or_else(|| target.host.clone());
                let server_name = ServerName::try_from(name).map_err(|e| {
                    TransportError::TlsError(format!("Invalid server name: {}", e))
                })?;
                Some((connector, server_name))
            }
        };

        debug!(
            target = %target.authority(),
            tls = target.tls.desc(),
            "Channel created"
        );

        Ok(Self {
            target,
            options,
            tls,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Number of calls currently holding a stream
    pub fn active_calls(&self) -> usize {
        self.tracker.len()
    }

    /// Open a stream and send the call frame
    pub async fn open_call(
        &self,
        metadata: Metadata,
        call: ProxyCall,
    ) -> Result<RpcStream, Status> {
        if self.is_shut_down() {
            return Err(TransportError::ChannelClosed.into());
        }

        let method = call.name();
        let token = self.tracker.token();
        let io = self.dial(method).await?;
        let mut stream = RpcStream::new(io, self.cancel.clone(), method, token);
        stream.send(ClientFrame::Call { metadata, call }).await?;
        Ok(stream)
    }

    /// Request/response exchange
    pub async fn unary(
        &self,
        metadata: Metadata,
        call: ProxyCall,
    ) -> Result<(Metadata, ProxyReply), Status> {
        let mut stream = self.open_call(metadata, call).await?;
        read_reply(&mut stream).await
    }

    /// Server-streaming call returning the relay's scrape requests
    ///
    /// The returned stream ends after the relay's `OK` status; any other
    /// status is yielded once as an error and ends the stream.
    pub async fn server_streaming(
        &self,
        metadata: Metadata,
        call: ProxyCall,
    ) -> Result<BoxStream<'static, Result<ScrapeRequest, Status>>, Status> {
        let stream = self.open_call(metadata, call).await?;

        let requests = stream::unfold(Some(stream), |state| async move {
            let mut stream = match state {
                Some(stream) => stream,
                None => return None,
            };
            match stream.recv().await {
                Ok(Some(ServerFrame::Request(request))) => Some((Ok(request), Some(stream))),
                Ok(Some(ServerFrame::Status(status))) if status.is_ok() => None,
                Ok(Some(ServerFrame::Status(status))) => Some((Err(status), None)),
                Ok(Some(ServerFrame::Reply { .. })) => Some((
                    Err(Status::internal(format!(
                        "{} received an unexpected reply frame",
                        stream.method()
                    ))),
                    None,
                )),
                Ok(None) => Some((
                    Err(Status::unavailable(format!(
                        "{} stream closed without status",
                        stream.method()
                    ))),
                    None,
                )),
                Err(status) => Some((Err(status), None)),
            }
        });

        Ok(requests.boxed())
    }

    /// Client-streaming call: write every frame, half-close, await the reply
    pub async fn client_streaming(
        &self,
        metadata: Metadata,
        call: ProxyCall,
        mut frames: BoxStream<'static, ClientFrame>,
    ) -> Result<(Metadata, ProxyReply), Status> {
        let mut stream = self.open_call(metadata, call).await?;
        let cancel = stream.cancellation_token();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Status::cancelled(format!(
                        "{} cancelled by channel shutdown",
                        stream.method()
                    )));
                }
                next = frames.next() => next,
            };

            match next {
                Some(frame) => stream.send(frame).await?,
                None => break,
            }
        }

        stream.send(ClientFrame::HalfClose).await?;
        read_reply(&mut stream).await
    }

    /// Shut the channel down: refuse new calls, give in-flight calls `grace`
    /// to finish, then cancel whatever is left
    pub async fn shutdown(&self, grace: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                target = %self.target.authority(),
                active_calls = self.tracker.len(),
                "Calls still active after grace period, forcing shutdown"
            );
        }

        self.cancel.cancel();

        info!(target = %self.target.authority(), "Channel shut down");
    }

    async fn dial(&self, method: &'static str) -> TransportResult<BoxedIo> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::ChannelClosed),
                result = tokio::time::timeout(self.options.connect_timeout, self.try_dial()) => {
                    result.unwrap_or(Err(TransportError::Timeout))
                }
            };

            match result {
                Ok(io) => return Ok(io),
                Err(e) if attempt < self.options.connect_attempts => {
                    debug!(
                        target = %self.target.authority(),
                        method = method,
                        attempt = attempt,
                        error = %e,
                        "Dial failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_dial(&self) -> TransportResult<BoxedIo> {
        let tcp_stream = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        tcp_stream.set_nodelay(true)?;

        match &self.tls {
            None => Ok(Box::new(tcp_stream)),
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), tcp_stream)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                Ok(Box::new(tls_stream))
            }
        }
    }
}

async fn read_reply(stream: &mut RpcStream) -> Result<(Metadata, ProxyReply), Status> {
    match stream.recv().await? {
        Some(ServerFrame::Reply { metadata, reply }) => Ok((metadata, reply)),
        Some(ServerFrame::Status(status)) if status.is_ok() => {
            Ok((Metadata::new(), ProxyReply::Empty))
        }
        Some(ServerFrame::Status(status)) => Err(status),
        Some(ServerFrame::Request(_)) => Err(Status::internal(format!(
            "{} received a request frame instead of a reply",
            stream.method()
        ))),
        None => Err(Status::unavailable(format!(
            "{} stream closed before reply",
            stream.method()
        ))),
    }
}
