//! Server configuration file

use anyhow::{Context, Result};
use kun_auth::{AuthOptions, PluginRegistry};
use kun_connection::{ClientAuthMode, ClientTlsConfig, ServerTlsConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    pub log: LogConfig,
    pub auth: AuthOptions,
    pub peer: PeerConfig,
    pub frontend: FrontendSection,
    pub backend: BackendConfig,
    pub registry: RegistryConfig,
    pub store: StoreConfig,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // An empty file means all defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }

    /// Check every section and report all problems at once
    pub fn validate(&self, plugins: &PluginRegistry) -> Result<()> {
        let mut errors = Vec::new();
        let sections: [(&str, Vec<String>); 7] = [
            ("log", self.log.validate()),
            ("auth", validate_auth(&self.auth, plugins)),
            ("peer", self.peer.validate()),
            ("frontend", self.frontend.validate()),
            ("backend", self.backend.validate()),
            ("registry", self.registry.validate()),
            ("store", self.store.validate()),
        ];
        for (section, problems) in sections {
            errors.extend(problems.into_iter().map(|p| format!("{}: {}", section, p)));
        }
        // Records must outlive the gap between two heartbeats
        if self.registry.ttl <= self.backend.heartbeat_interval {
            errors.push(format!(
                "registry: ttl ({}) must exceed backend.heartbeat_interval ({})",
                crate::duration::format(&self.registry.ttl),
                crate::duration::format(&self.backend.heartbeat_interval)
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "))
        }
    }
}

fn validate_auth(auth: &AuthOptions, plugins: &PluginRegistry) -> Vec<String> {
    let mut errors = Vec::new();
    if auth.method.trim().is_empty() {
        errors.push("method is required".to_string());
    } else if !plugins.contains(&auth.method) {
        errors.push(format!(
            "unknown method {:?}, expected one of {}",
            auth.method,
            plugins.names().join(", ")
        ));
    }
    errors
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Vec<String> {
        match tracing_subscriber::EnvFilter::try_new(&self.level) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("invalid level {:?}: {}", self.level, e)],
        }
    }
}

/// Certificate material of a listener, and the roots its peers are checked against
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub root_ca_files: Vec<PathBuf>,
    pub client_auth: String,
}

impl TlsSection {
    pub fn is_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    pub fn client_auth_mode(&self) -> Result<ClientAuthMode> {
        if self.client_auth.is_empty() {
            return Ok(ClientAuthMode::default());
        }
        Ok(self.client_auth.parse()?)
    }

    pub fn server_config(&self) -> Result<Option<ServerTlsConfig>> {
        let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) else {
            return Ok(None);
        };
        Ok(Some(
            ServerTlsConfig::new(cert, key)
                .with_client_auth(self.client_auth_mode()?, self.root_ca_files.clone()),
        ))
    }

    /// Outbound side: trust `root_ca_files` and present our own certificate
    pub fn client_config(&self) -> ClientTlsConfig {
        ClientTlsConfig {
            root_ca_files: self.root_ca_files.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            insecure_skip_verify: false,
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                check_file(&mut errors, "cert_file", cert);
                check_file(&mut errors, "key_file", key);
            }
            (None, None) => {}
            _ => errors.push("cert_file and key_file must be given together".to_string()),
        }
        for ca in &self.root_ca_files {
            check_file(&mut errors, "root_ca_files", ca);
        }
        if let Err(e) = self.client_auth_mode() {
            errors.push(e.to_string());
        }
        errors
    }
}

fn check_file(errors: &mut Vec<String>, field: &str, path: &Path) {
    let is_file = std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        errors.push(format!("{} {:?} is not a regular file", field, path));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    /// Generated at startup when absent
    pub node_id: Option<String>,
    pub bind: String,
    /// Address other members use to reach this node; derived from `bind` when absent
    pub advertise_addr: Option<String>,
    /// Peer URLs of every member, this node included
    pub members: Vec<String>,
    pub tls: TlsSection,
    #[serde(with = "crate::duration")]
    pub handshake_timeout: Duration,
    #[serde(with = "crate::duration")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::duration")]
    pub max_backoff: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind: ":7070".to_string(),
            advertise_addr: None,
            members: vec!["http://localhost:7070".to_string()],
            tls: TlsSection::default(),
            handshake_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl PeerConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bind.trim().is_empty() {
            errors.push("bind is required".to_string());
        }
        if matches!(&self.node_id, Some(id) if id.trim().is_empty()) {
            errors.push("node_id must not be empty".to_string());
        }
        for member in &self.members {
            if let Err(e) = kun_connection::dial_address(member) {
                errors.push(format!("member {:?}: {}", member, e));
            }
        }
        if let Some(addr) = &self.advertise_addr {
            if let Err(e) = kun_connection::dial_address(addr) {
                errors.push(format!("advertise_addr: {}", e));
            }
        }
        if self.initial_backoff > self.max_backoff {
            errors.push("initial_backoff exceeds max_backoff".to_string());
        }
        errors.extend(self.tls.validate().into_iter().map(|e| format!("tls: {}", e)));
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FrontendSection {
    /// Plain HTTP listener
    pub http: Option<String>,
    /// Terminating HTTPS listener; started only with a certificate in `tls`
    pub https: Option<String>,
    /// TLS passthrough listener routed by SNI
    pub passthrough: Option<String>,
    pub tls: TlsSection,
    #[serde(with = "crate::duration")]
    pub idle_timeout: Duration,
    #[serde(with = "crate::duration")]
    pub read_timeout: Duration,
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            http: Some(":8080".to_string()),
            https: Some(":8443".to_string()),
            passthrough: None,
            tls: TlsSection::default(),
            idle_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(300),
        }
    }
}

impl FrontendSection {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let http = self.http.as_deref().filter(|a| !a.trim().is_empty());
        let https = self.https.as_deref().filter(|a| !a.trim().is_empty());
        let passthrough = self.passthrough.as_deref().filter(|a| !a.trim().is_empty());

        if http.is_none() && https.is_none() {
            errors.push("at least one of http and https must be set".to_string());
        }
        if http.is_some() && http == https {
            errors.push("http and https addresses must differ".to_string());
        }
        if let Some(addr) = passthrough {
            if Some(addr) == http || Some(addr) == https {
                errors.push("passthrough address must differ from http and https".to_string());
            }
        }
        if self.idle_timeout.is_zero() {
            errors.push("idle_timeout must be positive".to_string());
        }
        if self.read_timeout.is_zero() {
            errors.push("read_timeout must be positive".to_string());
        }
        errors.extend(self.tls.validate().into_iter().map(|e| format!("tls: {}", e)));
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub bind: String,
    pub tls: TlsSection,
    #[serde(with = "crate::duration")]
    pub heartbeat_interval: Duration,
    #[serde(with = "crate::duration")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "crate::duration")]
    pub handshake_timeout: Duration,
    /// Secret for login tokens; a random one is used when absent
    pub token_secret: Option<String>,
    #[serde(with = "crate::duration")]
    pub token_validity: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind: ":8090".to_string(),
            tls: TlsSection::default(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            token_secret: None,
            token_validity: Duration::from_secs(24 * 3600),
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bind.trim().is_empty() {
            errors.push("bind is required".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be positive".to_string());
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            errors.push("heartbeat_timeout must exceed heartbeat_interval".to_string());
        }
        if matches!(&self.token_secret, Some(s) if s.len() < 16) {
            errors.push("token_secret must be at least 16 bytes".to_string());
        }
        errors.extend(self.tls.validate().into_iter().map(|e| format!("tls: {}", e)));
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Lifetime of an upstream record between heartbeats
    #[serde(with = "crate::duration")]
    pub ttl: Duration,
    /// Drop expired records this often; lookups skip them either way
    #[serde(with = "crate::duration::option")]
    pub cleanup_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            cleanup_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.ttl.is_zero() {
            errors.push("ttl must be positive".to_string());
        }
        if matches!(self.cleanup_interval, Some(d) if d.is_zero()) {
            errors.push("cleanup_interval must be positive".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// sea-orm connection URL; persistence is off when absent
    pub database_url: Option<String>,
}

impl StoreConfig {
    fn validate(&self) -> Vec<String> {
        match &self.database_url {
            Some(url) if !url.contains(':') => {
                vec![format!("database_url {:?} is not a connection URL", url)]
            }
            _ => Vec::new(),
        }
    }
}
