//! Process-wide agent state shared by every task of a connection cycle

use crate::error::AgentError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Where the current connection cycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    /// Streams are open and the heartbeat is running
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "DISCONNECTED",
            LifecycleState::Connecting => "CONNECTING",
            LifecycleState::Connected => "CONNECTED",
            LifecycleState::Registered => "REGISTERED",
            LifecycleState::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

/// Identity, running flag and counters of one agent process
pub struct AgentState {
    launch_id: String,
    agent_name: String,
    host_name: String,
    agent_id: RwLock<String>,
    running: AtomicBool,
    lifecycle: RwLock<LifecycleState>,
    scrape_backlog: AtomicI64,
    sent_messages: AtomicU64,
    epoch: Instant,
    last_sent_millis: AtomicU64,
}

impl fmt::Debug for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentState")
            .field("launch_id", &self.launch_id)
            .field("agent_name", &self.agent_name)
            .field("agent_id", &self.agent_id())
            .field("lifecycle", &self.lifecycle())
            .field("scrape_backlog", &self.scrape_backlog())
            .finish()
    }
}

impl AgentState {
    /// `agent_name` empty means `Unnamed-<hostname>`
    pub fn new(launch_id: impl Into<String>, agent_name: &str) -> Self {
        let host_name = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let agent_name = if agent_name.is_empty() {
            format!("Unnamed-{}", host_name)
        } else {
            agent_name.to_string()
        };

        Self {
            launch_id: launch_id.into(),
            agent_name,
            host_name,
            agent_id: RwLock::new(String::new()),
            running: AtomicBool::new(false),
            lifecycle: RwLock::new(LifecycleState::Disconnected),
            scrape_backlog: AtomicI64::new(0),
            sent_messages: AtomicU64::new(0),
            epoch: Instant::now(),
            last_sent_millis: AtomicU64::new(0),
        }
    }

    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Relay-assigned id, empty until the connect handshake succeeds
    pub fn agent_id(&self) -> String {
        self.agent_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Capture the relay-assigned id
    ///
    /// Re-assigning the same id is a no-op; a different id within one
    /// connection cycle is refused.
    pub fn assign_agent_id(&self, agent_id: &str) -> Result<(), AgentError> {
        if agent_id.is_empty() {
            return Err(crate::error::empty_agent_id());
        }

        let mut current = self.agent_id.write().unwrap_or_else(|e| e.into_inner());
        if current.is_empty() {
            *current = agent_id.to_string();
            Ok(())
        } else if *current == agent_id {
            Ok(())
        } else {
            Err(AgentError::InvalidArgument(format!(
                "agentId already assigned: {} (got {})",
                current, agent_id
            )))
        }
    }

    /// Forget the id before a fresh connection cycle
    pub fn clear_agent_id(&self) {
        self.agent_id
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the running flag, returning the previous value
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transition(&self, to: LifecycleState) {
        let mut state = self.lifecycle.write().unwrap_or_else(|e| e.into_inner());
        if *state != to {
            tracing::debug!(from = %*state, to = %to, "Lifecycle transition");
            *state = to;
        }
    }

    pub fn scrape_backlog(&self) -> i64 {
        self.scrape_backlog.load(Ordering::SeqCst)
    }

    pub fn increment_backlog(&self) {
        self.scrape_backlog.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_backlog(&self) {
        self.scrape_backlog.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn reset_backlog(&self) {
        self.scrape_backlog.store(0, Ordering::SeqCst);
    }

    pub fn sent_message_count(&self) -> u64 {
        self.sent_messages.load(Ordering::SeqCst)
    }

    /// Record an outbound message; resets the heartbeat inactivity clock
    pub fn mark_msg_sent(&self) {
        self.sent_messages.fetch_add(1, Ordering::SeqCst);
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_sent_millis.store(millis, Ordering::SeqCst);
    }

    pub fn since_last_msg_sent(&self) -> Duration {
        let last = Duration::from_millis(self.last_sent_millis.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// One-shot latch opened by a successful `registerAgent()`
#[derive(Clone)]
pub struct StartGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait at most `timeout`; true if the gate opened
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
