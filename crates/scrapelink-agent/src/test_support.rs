//! In-memory relay and fetcher doubles for unit tests

use crate::error::AgentError;
use crate::fetch::{ScrapeFetcher, ScrapeResult};
use crate::service::{ProxyConnector, ProxyService, ScrapeRequestStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use scrapelink_proto::{
    AgentInfo, ChunkedScrapeResponse, ConnectAgentResponse, HeartBeatRequest, HeartBeatResponse,
    PathMapSizeRequest, PathMapSizeResponse, RegisterAgentRequest, RegisterAgentResponse,
    RegisterPathRequest, RegisterPathResponse, ScrapeRequest, ScrapeResponse, Status,
    UnregisterPathRequest, UnregisterPathResponse,
};
use scrapelink_transport::ChannelTarget;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Feed = Result<ScrapeRequest, Status>;

#[derive(Default)]
struct RequestFeed {
    pending: VecDeque<Feed>,
    close_next: bool,
    tx: Option<mpsc::UnboundedSender<Feed>>,
}

#[derive(Default)]
struct Behavior {
    connect_failure: Option<Status>,
    stall_connect: bool,
    register_rejection: Option<String>,
    heartbeat_rejection: Option<String>,
    heartbeat_failure: Option<Status>,
    plain_write_failure: Option<Status>,
    crash_chunked_writes: bool,
}

/// Relay double recording every call
pub(crate) struct MockProxy {
    agent_id: String,
    behavior: Mutex<Behavior>,
    calls: Mutex<Vec<&'static str>>,
    registrations: Mutex<Vec<RegisterAgentRequest>>,
    paths: Mutex<BTreeSet<String>>,
    feed: Mutex<RequestFeed>,
    reads: AtomicUsize,
    responses: Mutex<Vec<ScrapeResponse>>,
    chunked: Mutex<Vec<ChunkedScrapeResponse>>,
    shutdowns: AtomicUsize,
    changed: Notify,
}

impl MockProxy {
    pub(crate) fn new(agent_id: &str) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.to_string(),
            behavior: Mutex::default(),
            calls: Mutex::default(),
            registrations: Mutex::default(),
            paths: Mutex::default(),
            feed: Mutex::default(),
            reads: AtomicUsize::new(0),
            responses: Mutex::default(),
            chunked: Mutex::default(),
            shutdowns: AtomicUsize::new(0),
            changed: Notify::new(),
        })
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    pub(crate) fn fail_connect(&self, status: Status) {
        self.behavior.lock().unwrap().connect_failure = Some(status);
    }

    pub(crate) fn stall_connect(&self) {
        self.behavior.lock().unwrap().stall_connect = true;
    }

    pub(crate) fn reject_register(&self, reason: &str) {
        self.behavior.lock().unwrap().register_rejection = Some(reason.to_string());
    }

    pub(crate) fn reject_heartbeat(&self, reason: &str) {
        self.behavior.lock().unwrap().heartbeat_rejection = Some(reason.to_string());
    }

    pub(crate) fn fail_heartbeat(&self, status: Status) {
        let mut behavior = self.behavior.lock().unwrap();
        behavior.heartbeat_rejection = None;
        behavior.heartbeat_failure = Some(status);
    }

    pub(crate) fn fail_plain_writes(&self, status: Status) {
        self.behavior.lock().unwrap().plain_write_failure = Some(status);
    }

    /// The chunked writer panics as soon as it starts
    pub(crate) fn crash_chunked_writes(&self) {
        self.behavior.lock().unwrap().crash_chunked_writes = true;
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.calls().iter().filter(|c| **c == "sendHeartBeat").count()
    }

    pub(crate) fn registrations(&self) -> Vec<RegisterAgentRequest> {
        self.registrations.lock().unwrap().clone()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().iter().cloned().collect()
    }

    pub(crate) fn responses(&self) -> Vec<ScrapeResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub(crate) fn chunked(&self) -> Vec<ChunkedScrapeResponse> {
        self.chunked.lock().unwrap().clone()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Deliver a request on the current (or next) request stream
    pub(crate) fn push_request(&self, request: ScrapeRequest) {
        self.push_feed(Ok(request));
    }

    /// End the request stream with an error status
    pub(crate) fn fail_requests(&self, status: Status) {
        self.push_feed(Err(status));
        self.close_requests();
    }

    /// End the current (or next) request stream normally
    pub(crate) fn close_requests(&self) {
        let mut feed = self.feed.lock().unwrap();
        if feed.tx.take().is_none() {
            feed.close_next = true;
        }
    }

    fn push_feed(&self, item: Feed) {
        let mut feed = self.feed.lock().unwrap();
        let undelivered = match &feed.tx {
            Some(tx) => tx.send(item).err().map(|e| e.0),
            None => Some(item),
        };
        if let Some(item) = undelivered {
            feed.pending.push_back(item);
        }
    }

    pub(crate) async fn wait_for_reads(&self, count: usize) {
        self.wait_until(|proxy| proxy.reads.load(Ordering::SeqCst) >= count)
            .await
    }

    pub(crate) async fn wait_for_plain_responses(&self, count: usize) {
        self.wait_until(|proxy| proxy.responses.lock().unwrap().len() >= count)
            .await
    }

    async fn wait_until(&self, ready: impl Fn(&Self) -> bool) {
        let wait = async {
            loop {
                let changed = self.changed.notified();
                if ready(self) {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("condition not reached in time");
    }
}

#[async_trait]
impl ProxyService for MockProxy {
    async fn connect_agent(&self) -> Result<ConnectAgentResponse, Status> {
        self.record("connectAgent");
        let (failure, stall) = {
            let behavior = self.behavior.lock().unwrap();
            (behavior.connect_failure.clone(), behavior.stall_connect)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if let Some(status) = failure {
            return Err(status);
        }
        // A fresh agent on the relay side
        self.paths.lock().unwrap().clear();
        Ok(ConnectAgentResponse {
            agent_id: self.agent_id.clone(),
        })
    }

    async fn connect_agent_with_transport_filter_disabled(
        &self,
    ) -> Result<ConnectAgentResponse, Status> {
        self.record("connectAgentWithTransportFilterDisabled");
        self.paths.lock().unwrap().clear();
        Ok(ConnectAgentResponse {
            agent_id: self.agent_id.clone(),
        })
    }

    async fn register_agent(
        &self,
        request: RegisterAgentRequest,
    ) -> Result<RegisterAgentResponse, Status> {
        self.record("registerAgent");
        let agent_id = request.agent_id.clone();
        self.registrations.lock().unwrap().push(request);
        let rejection = self.behavior.lock().unwrap().register_rejection.clone();
        Ok(RegisterAgentResponse {
            agent_id,
            valid: rejection.is_none(),
            reason: rejection.unwrap_or_default(),
        })
    }

    async fn path_map_size(
        &self,
        _request: PathMapSizeRequest,
    ) -> Result<PathMapSizeResponse, Status> {
        self.record("pathMapSize");
        Ok(PathMapSizeResponse {
            path_count: self.paths.lock().unwrap().len() as u32,
        })
    }

    async fn register_path(
        &self,
        request: RegisterPathRequest,
    ) -> Result<RegisterPathResponse, Status> {
        self.record("registerPath");
        let mut paths = self.paths.lock().unwrap();
        if !paths.insert(request.path.clone()) {
            return Ok(RegisterPathResponse {
                valid: false,
                reason: format!("Path already registered: {}", request.path),
                path_count: paths.len() as u32,
                path_id: 0,
            });
        }
        Ok(RegisterPathResponse {
            valid: true,
            reason: String::new(),
            path_count: paths.len() as u32,
            path_id: paths.len() as u64,
        })
    }

    async fn unregister_path(
        &self,
        request: UnregisterPathRequest,
    ) -> Result<UnregisterPathResponse, Status> {
        self.record("unregisterPath");
        let removed = self.paths.lock().unwrap().remove(&request.path);
        Ok(UnregisterPathResponse {
            valid: removed,
            reason: if removed {
                String::new()
            } else {
                format!("Path not registered: {}", request.path)
            },
        })
    }

    async fn send_heart_beat(
        &self,
        _request: HeartBeatRequest,
    ) -> Result<HeartBeatResponse, Status> {
        self.record("sendHeartBeat");
        let behavior = self.behavior.lock().unwrap();
        if let Some(status) = &behavior.heartbeat_failure {
            return Err(status.clone());
        }
        Ok(HeartBeatResponse {
            valid: behavior.heartbeat_rejection.is_none(),
            reason: behavior.heartbeat_rejection.clone().unwrap_or_default(),
        })
    }

    async fn read_requests_from_proxy(
        &self,
        _info: AgentInfo,
    ) -> Result<ScrapeRequestStream, Status> {
        self.record("readRequestsFromProxy");
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut feed = self.feed.lock().unwrap();
            while let Some(item) = feed.pending.pop_front() {
                let _ = tx.send(item);
            }
            if std::mem::take(&mut feed.close_next) {
                feed.tx = None;
            } else {
                feed.tx = Some(tx);
            }
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn write_responses_to_proxy(
        &self,
        mut responses: BoxStream<'static, ScrapeResponse>,
    ) -> Result<(), Status> {
        self.record("writeResponsesToProxy");
        self.changed.notify_waiters();
        if let Some(status) = self.behavior.lock().unwrap().plain_write_failure.clone() {
            return Err(status);
        }
        while let Some(response) = responses.next().await {
            self.responses.lock().unwrap().push(response);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn write_chunked_responses_to_proxy(
        &self,
        mut frames: BoxStream<'static, ChunkedScrapeResponse>,
    ) -> Result<(), Status> {
        self.record("writeChunkedResponsesToProxy");
        let crash = self.behavior.lock().unwrap().crash_chunked_writes;
        if crash {
            panic!("chunked writer crashed");
        }
        while let Some(frame) = frames.next().await {
            self.chunked.lock().unwrap().push(frame);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        let mut feed = self.feed.lock().unwrap();
        if let Some(tx) = feed.tx.take() {
            let _ = tx.send(Err(Status::cancelled("channel shut down")));
        }
    }
}

/// Connector handing out the same [`MockProxy`] on every connect
pub(crate) struct MockConnector {
    proxy: Arc<MockProxy>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new(proxy: Arc<MockProxy>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            connects: AtomicUsize::new(0),
        })
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ProxyConnector for MockConnector {
    fn connect(&self, _target: &ChannelTarget) -> Result<Arc<dyn ProxyService>, AgentError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.proxy.clone())
    }
}

/// Fetcher returning the same body for every request
pub(crate) struct StaticFetcher {
    content: Bytes,
    zipped: bool,
    delay: Option<Duration>,
}

impl StaticFetcher {
    pub(crate) fn new(content: Vec<u8>, zipped: bool) -> Self {
        Self {
            content: Bytes::from(content),
            zipped,
            delay: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ScrapeFetcher for StaticFetcher {
    async fn fetch(&self, request: ScrapeRequest) -> ScrapeResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        ScrapeResult {
            agent_id: request.agent_id,
            scrape_id: request.scrape_id,
            valid_response: true,
            status_code: 200,
            content_type: "text/plain".to_string(),
            zipped: self.zipped,
            content: self.content.clone(),
            failure_reason: String::new(),
            url: format!("http://localhost/{}", request.path),
        }
    }
}

/// HTTP server answering every request with `body`; returns its url
pub(crate) async fn serve_http(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(reply.as_bytes()).await;
        }
    });
    format!("http://{}/metrics", addr)
}
