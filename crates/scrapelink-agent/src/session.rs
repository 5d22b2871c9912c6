//! Transport session: the single connection handle to the relay

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::service::{ProxyConnector, ProxyService};
use scrapelink_proto::DEFAULT_PROXY_PORT;
use scrapelink_transport::{ChannelTarget, TlsMode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Parsed `[http://|https://]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
    /// The address carried an `https://` scheme
    pub https: bool,
}

impl ProxyAddress {
    pub fn parse(address: &str) -> Result<Self, AgentError> {
        let trimmed = address.trim();
        let (rest, https) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (rest, true)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (rest, false)
        } else {
            (trimmed, false)
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rfind(':') {
            Some(idx) => {
                let port = rest[idx + 1..]
                    .parse::<u16>()
                    .map_err(|_| AgentError::Address(address.to_string()))?;
                (&rest[..idx], port)
            }
            None => (rest, DEFAULT_PROXY_PORT),
        };

        if host.is_empty() {
            return Err(AgentError::Address(address.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            https,
        })
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Holder of the relay connection handle
///
/// The handle is replaced only under the reset lock; readers clone the
/// current `Arc` out of the slot. An old handle is always shut down before
/// its replacement is built.
pub struct ProxySession {
    target: ChannelTarget,
    connector: Arc<dyn ProxyConnector>,
    shutdown_grace: Duration,
    service: RwLock<Option<Arc<dyn ProxyService>>>,
    reset_lock: Mutex<()>,
}

impl fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySession")
            .field("target", &self.target)
            .finish()
    }
}

impl ProxySession {
    /// Resolve the target from `config`; no connection is made yet
    pub fn new(
        config: &AgentConfig,
        connector: Arc<dyn ProxyConnector>,
    ) -> Result<Self, AgentError> {
        let address = ProxyAddress::parse(&config.proxy_address)?;
        let settings = config.tls_settings();

        let tls = if address.https || settings.has_material() {
            TlsMode::Tls(settings)
        } else {
            TlsMode::Plaintext
        };

        let override_authority =
            (!config.override_authority.is_empty()).then(|| config.override_authority.clone());

        Ok(Self {
            target: ChannelTarget {
                host: address.host,
                port: address.port,
                tls,
                override_authority,
            },
            connector,
            shutdown_grace: config.shutdown_grace,
            service: RwLock::new(None),
            reset_lock: Mutex::new(()),
        })
    }

    /// Resolve the target and build the first handle
    pub async fn connect(
        config: &AgentConfig,
        connector: Arc<dyn ProxyConnector>,
    ) -> Result<Self, AgentError> {
        let session = Self::new(config, connector)?;
        session.reset_connection().await?;
        Ok(session)
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    pub fn host_name(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    pub fn proxy_host(&self) -> String {
        self.target.authority()
    }

    /// Tear down the current handle and build a fresh one
    pub async fn reset_connection(&self) -> Result<(), AgentError> {
        let _reset = self.reset_lock.lock().await;

        let previous = self.service.write().await.take();
        if let Some(previous) = previous {
            debug!(proxy = %self.proxy_host(), "Shutting down previous channel");
            previous.shutdown(self.shutdown_grace).await;
        }

        info!(
            proxy = %self.proxy_host(),
            tls = self.target.tls.desc(),
            "Creating channel"
        );
        let service = self.connector.connect(&self.target)?;
        *self.service.write().await = Some(service);
        Ok(())
    }

    /// Current handle
    pub async fn service(&self) -> Result<Arc<dyn ProxyService>, AgentError> {
        self.service
            .read()
            .await
            .clone()
            .ok_or(AgentError::NotConnected)
    }

    pub async fn is_connected(&self) -> bool {
        self.service.read().await.is_some()
    }

    /// Release the handle; safe to call repeatedly
    pub async fn shut_down(&self) {
        let _reset = self.reset_lock.lock().await;
        let service = self.service.write().await.take();
        if let Some(service) = service {
            service.shutdown(self.shutdown_grace).await;
            info!(proxy = %self.proxy_host(), "Session shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnector, MockProxy};

    #[test]
    fn test_parse_https_with_port() {
        let address = ProxyAddress::parse("https://relay.example:9443").unwrap();
        assert_eq!(address.host, "relay.example");
        assert_eq!(address.port, 9443);
        assert!(address.https);
    }

    #[test]
    fn test_parse_bare_host_uses_default_port() {
        let address = ProxyAddress::parse("relay.example").unwrap();
        assert_eq!(address.host, "relay.example");
        assert_eq!(address.port, 50051);
        assert!(!address.https);
        assert_eq!(address.to_string(), "relay.example:50051");
    }

    #[test]
    fn test_parse_http_scheme_stripped() {
        let address = ProxyAddress::parse("http://10.0.0.5:6000/").unwrap();
        assert_eq!(address.host, "10.0.0.5");
        assert_eq!(address.port, 6000);
        assert!(!address.https);
    }

    #[test]
    fn test_parse_rejects_bad_port_and_empty_host() {
        assert!(matches!(
            ProxyAddress::parse("relay.example:http"),
            Err(AgentError::Address(_))
        ));
        assert!(ProxyAddress::parse("relay.example:70000").is_err());
        assert!(ProxyAddress::parse("https://:9443").is_err());
        assert!(ProxyAddress::parse("").is_err());
    }

    #[test]
    fn test_tls_selection() {
        let connector = MockConnector::new(MockProxy::new("1"));

        let config = AgentConfig::builder()
            .proxy_address("https://relay.example:9443")
            .build()
            .unwrap();
        let session = ProxySession::new(&config, connector.clone()).unwrap();
        assert!(session.target().tls.is_tls());
        assert_eq!(session.host_name(), "relay.example");
        assert_eq!(session.port(), 9443);

        let config = AgentConfig::builder()
            .proxy_address("relay.example")
            .build()
            .unwrap();
        let session = ProxySession::new(&config, connector.clone()).unwrap();
        assert!(!session.target().tls.is_tls());

        let config = AgentConfig::builder()
            .proxy_address("relay.example")
            .tls("", "", "/etc/ca.pem")
            .override_authority("relay.internal")
            .build()
            .unwrap();
        let session = ProxySession::new(&config, connector).unwrap();
        assert!(session.target().tls.is_tls());
        assert_eq!(
            session.target().override_authority.as_deref(),
            Some("relay.internal")
        );
    }

    #[tokio::test]
    async fn test_reset_shuts_down_previous_handle() {
        let proxy = MockProxy::new("1");
        let connector = MockConnector::new(proxy.clone());
        let session = ProxySession::connect(&AgentConfig::default(), connector.clone())
            .await
            .unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(proxy.shutdowns(), 0);

        session.reset_connection().await.unwrap();
        session.reset_connection().await.unwrap();
        assert_eq!(connector.connects(), 3);
        assert_eq!(proxy.shutdowns(), 2);
        assert!(session.service().await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_resets_are_serialized() {
        let proxy = MockProxy::new("1");
        let connector = MockConnector::new(proxy.clone());
        let session = Arc::new(
            ProxySession::connect(&AgentConfig::default(), connector.clone())
                .await
                .unwrap(),
        );

        let resets: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.reset_connection().await })
            })
            .collect();
        for reset in resets {
            reset.await.unwrap().unwrap();
        }

        // Every connect but the live one was shut down exactly once
        assert_eq!(connector.connects(), 9);
        assert_eq!(proxy.shutdowns(), 8);
    }

    #[tokio::test]
    async fn test_shut_down_is_idempotent() {
        let proxy = MockProxy::new("1");
        let connector = MockConnector::new(proxy.clone());
        let session = ProxySession::connect(&AgentConfig::default(), connector)
            .await
            .unwrap();

        session.shut_down().await;
        session.shut_down().await;
        assert_eq!(proxy.shutdowns(), 1);
        assert!(matches!(
            session.service().await,
            Err(AgentError::NotConnected)
        ));
    }
}
