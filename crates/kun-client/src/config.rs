//! Client configuration

use crate::ClientError;
use kun_connection::BackoffConfig;
use kun_proto::{Credentials, DEFAULT_CHANNEL_WINDOW};
use kun_router::validate_domain;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend control address (`host:port` or `scheme://host:port`)
    pub server: String,
    pub credentials: Credentials,
    /// Domains to register, normalized
    pub domains: Vec<String>,
    /// Local service every data channel is relayed to
    pub target: String,
    pub connect_timeout: Duration,
    /// Overrides the interval the server asks for
    pub heartbeat_interval: Option<Duration>,
    pub idle_timeout: Duration,
    pub channel_window: u32,
    pub reconnect: BackoffConfig,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    server: Option<String>,
    credentials: Option<Credentials>,
    domains: Vec<String>,
    target: Option<String>,
    connect_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    idle_timeout: Option<Duration>,
    reconnect: Option<BackoffConfig>,
}

impl ClientConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn access_key(mut self, access_key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::AccessKey {
            access_key_id: access_key_id.into(),
            secret: secret.into(),
        });
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::Token(token.into()));
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = Some(backoff);
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        let server = self
            .server
            .ok_or_else(|| ClientError::InvalidConfig("server address is required".to_string()))?;
        let credentials = self
            .credentials
            .ok_or_else(|| ClientError::InvalidConfig("credentials are required".to_string()))?;
        let target = self
            .target
            .ok_or_else(|| ClientError::InvalidConfig("target address is required".to_string()))?;

        if self.domains.is_empty() {
            return Err(ClientError::InvalidConfig(
                "at least one domain is required".to_string(),
            ));
        }
        let mut domains = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let domain = validate_domain(domain)
                .map_err(|e| ClientError::InvalidConfig(format!("{}: {}", domain, e)))?;
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        Ok(ClientConfig {
            server,
            credentials,
            domains,
            target,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout.unwrap_or(Duration::from_secs(300)),
            channel_window: DEFAULT_CHANNEL_WINDOW,
            reconnect: self.reconnect.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_normalizes_domains() {
        let config = ClientConfig::builder()
            .server("localhost:8090")
            .access_key("alice", "secret")
            .domain("A.Example.com")
            .domain("a.example.com.")
            .domain("b.example.com")
            .target("127.0.0.1:3000")
            .build()
            .unwrap();

        assert_eq!(config.domains, vec!["a.example.com", "b.example.com"]);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.heartbeat_interval.is_none());
    }

    #[test]
    fn test_build_requires_fields() {
        let missing_domain = ClientConfig::builder()
            .server("localhost:8090")
            .token("t")
            .target("127.0.0.1:3000")
            .build();
        assert!(matches!(missing_domain, Err(ClientError::InvalidConfig(_))));

        let missing_credentials = ClientConfig::builder()
            .server("localhost:8090")
            .domain("a.example.com")
            .target("127.0.0.1:3000")
            .build();
        assert!(matches!(missing_credentials, Err(ClientError::InvalidConfig(_))));

        let bad_domain = ClientConfig::builder()
            .server("localhost:8090")
            .token("t")
            .domain("not a domain")
            .target("127.0.0.1:3000")
            .build();
        assert!(matches!(bad_domain, Err(ClientError::InvalidConfig(_))));
    }
}
