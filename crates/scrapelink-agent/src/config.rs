//! Agent configuration

use crate::error::AgentError;
use crate::session::ProxyAddress;
use scrapelink_transport::{ChannelOptions, TlsSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Room left in a frame for the fields that travel next to a content block
const FRAME_HEADROOM_BYTES: usize = 64 * 1024;

/// One path the agent serves, and where its content is fetched from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathConfig {
    #[serde(default)]
    pub name: String,
    pub path: String,
    pub url: String,
}

/// Agent configuration
///
/// Every field has a default, so a YAML file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `[http://|https://]host[:port]`
    pub proxy_address: String,
    /// Empty means `Unnamed-<hostname>`
    pub agent_name: String,
    pub consolidated: bool,

    pub cert_chain_path: String,
    pub private_key_path: String,
    pub trust_cert_collection_path: String,
    pub override_authority: String,

    /// Results at or above this many KB (compressed) are sent chunked
    pub chunk_content_size_kbs: usize,
    pub transport_filter_disabled: bool,

    pub heartbeat_enabled: bool,
    #[serde(with = "duration_millis")]
    pub heartbeat_check_pause: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_max_inactivity: Duration,

    #[serde(with = "duration_secs")]
    pub reconnect_pause: Duration,
    pub connect_attempts: u32,
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub in_flight_drain_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    pub min_gzip_size_bytes: usize,
    #[serde(with = "duration_secs")]
    pub scrape_timeout: Duration,

    pub paths: Vec<PathConfig>,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same, in milliseconds, for the sub-second pauses
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_address: format!("localhost:{}", scrapelink_proto::DEFAULT_PROXY_PORT),
            agent_name: String::new(),
            consolidated: false,
            cert_chain_path: String::new(),
            private_key_path: String::new(),
            trust_cert_collection_path: String::new(),
            override_authority: String::new(),
            chunk_content_size_kbs: 32,
            transport_filter_disabled: false,
            heartbeat_enabled: true,
            heartbeat_check_pause: Duration::from_millis(500),
            heartbeat_max_inactivity: Duration::from_secs(5),
            reconnect_pause: Duration::from_secs(3),
            connect_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            call_timeout: Duration::from_secs(10),
            in_flight_drain_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(1),
            min_gzip_size_bytes: 512,
            scrape_timeout: Duration::from_secs(15),
            paths: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Chunk threshold and block size in bytes
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_content_size_kbs.saturating_mul(1024)
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings::from_paths(
            &self.cert_chain_path,
            &self.private_key_path,
            &self.trust_cert_collection_path,
        )
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            connect_attempts: self.connect_attempts,
            retry_backoff: self.retry_backoff,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        ProxyAddress::parse(&self.proxy_address)?;

        if self.chunk_content_size_kbs == 0 {
            return Err(AgentError::Config(
                "chunk_content_size_kbs must be > 0".to_string(),
            ));
        }
        let max_chunk_bytes = scrapelink_proto::MAX_FRAME_SIZE - FRAME_HEADROOM_BYTES;
        match self.chunk_content_size_kbs.checked_mul(1024) {
            Some(bytes) if bytes <= max_chunk_bytes => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "chunk_content_size_kbs must be <= {} to fit a frame",
                    max_chunk_bytes / 1024
                )))
            }
        }
        if self.connect_attempts == 0 {
            return Err(AgentError::Config("connect_attempts must be > 0".to_string()));
        }
        if self.heartbeat_enabled && self.heartbeat_check_pause.is_zero() {
            return Err(AgentError::Config(
                "heartbeat_check_pause must be > 0".to_string(),
            ));
        }
        for entry in &self.paths {
            if entry.path.trim_start_matches('/').is_empty() || entry.url.is_empty() {
                return Err(AgentError::Config(format!(
                    "path entries need a path and a url: {:?}",
                    entry
                )));
            }
        }
        Ok(())
    }
}

/// Builder for AgentConfig
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn proxy_address(mut self, address: impl Into<String>) -> Self {
        self.config.proxy_address = address.into();
        self
    }

    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.config.agent_name = name.into();
        self
    }

    pub fn consolidated(mut self, consolidated: bool) -> Self {
        self.config.consolidated = consolidated;
        self
    }

    pub fn tls(
        mut self,
        cert_chain_path: impl Into<String>,
        private_key_path: impl Into<String>,
        trust_cert_collection_path: impl Into<String>,
    ) -> Self {
        self.config.cert_chain_path = cert_chain_path.into();
        self.config.private_key_path = private_key_path.into();
        self.config.trust_cert_collection_path = trust_cert_collection_path.into();
        self
    }

    pub fn override_authority(mut self, authority: impl Into<String>) -> Self {
        self.config.override_authority = authority.into();
        self
    }

    pub fn chunk_content_size_kbs(mut self, kbs: usize) -> Self {
        self.config.chunk_content_size_kbs = kbs;
        self
    }

    pub fn transport_filter_disabled(mut self, disabled: bool) -> Self {
        self.config.transport_filter_disabled = disabled;
        self
    }

    pub fn heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.config.heartbeat_enabled = enabled;
        self
    }

    pub fn heartbeat_timing(mut self, check_pause: Duration, max_inactivity: Duration) -> Self {
        self.config.heartbeat_check_pause = check_pause;
        self.config.heartbeat_max_inactivity = max_inactivity;
        self
    }

    pub fn reconnect_pause(mut self, pause: Duration) -> Self {
        self.config.reconnect_pause = pause;
        self
    }

    pub fn retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.connect_attempts = attempts;
        self.config.retry_backoff = backoff;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn in_flight_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.in_flight_drain_timeout = timeout;
        self
    }

    pub fn path(mut self, path: impl Into<String>, url: impl Into<String>) -> Self {
        let path = path.into();
        self.config.paths.push(PathConfig {
            name: path.trim_start_matches('/').to_string(),
            path,
            url: url.into(),
        });
        self
    }

    pub fn build(self) -> Result<AgentConfig, AgentError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
