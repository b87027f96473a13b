//! `STATIC` auth plugin: credentials and domain grants listed in configuration

use crate::password::{constant_time_eq, is_hashed, verify_secret};
use crate::plugin::{AuthPlugin, PluginOptions};
use crate::AuthError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Domain grant: an exact name or a `*.` wildcard matching one extra label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    Wildcard { suffix: String },
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Result<Self, AuthError> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(AuthError::InvalidOptions("empty domain pattern".to_string()));
        }

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') || !suffix.contains('.') {
                return Err(AuthError::InvalidOptions(format!(
                    "invalid wildcard pattern: {}",
                    pattern
                )));
            }
            return Ok(Self::Wildcard {
                suffix: suffix.to_string(),
            });
        }

        if pattern.contains('*') {
            return Err(AuthError::InvalidOptions(format!(
                "wildcard only allowed as leading label: {}",
                pattern
            )));
        }
        Ok(Self::Exact(pattern))
    }

    /// `domain` must already be normalized (lowercase, no trailing dot)
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            Self::Exact(name) => name == domain,
            Self::Wildcard { suffix } => match domain.strip_suffix(suffix.as_str()) {
                Some(prefix) => match prefix.strip_suffix('.') {
                    Some(label) => !label.is_empty() && !label.contains('.'),
                    None => false,
                },
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticCredential {
    pub access_key_id: String,
    /// Plaintext or an argon2 PHC string
    pub secret: String,
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StaticOptions {
    #[serde(default)]
    pub credentials: Vec<StaticCredential>,
}

#[derive(Debug, Clone)]
struct Grant {
    secret: String,
    patterns: Vec<DomainPattern>,
}

#[derive(Debug, Default)]
pub struct StaticPlugin {
    options: StaticOptions,
    grants: HashMap<String, Grant>,
}

impl StaticPlugin {
    pub const NAME: &'static str = "STATIC";

    pub fn from_options(options: StaticOptions) -> Result<Self, AuthError> {
        let mut plugin = Self::default();
        plugin.load(options)?;
        plugin.validate()?;
        Ok(plugin)
    }

    fn load(&mut self, options: StaticOptions) -> Result<(), AuthError> {
        let mut grants = HashMap::with_capacity(options.credentials.len());
        for credential in &options.credentials {
            let patterns = credential
                .domains
                .iter()
                .map(|p| DomainPattern::parse(p))
                .collect::<Result<Vec<_>, _>>()?;
            grants.insert(
                credential.access_key_id.clone(),
                Grant {
                    secret: credential.secret.clone(),
                    patterns,
                },
            );
        }
        self.grants = grants;
        self.options = options;
        Ok(())
    }
}

#[async_trait]
impl AuthPlugin for StaticPlugin {
    async fn setup(&mut self, options: &PluginOptions) -> Result<(), AuthError> {
        let parsed: StaticOptions = if options.is_null() {
            StaticOptions::default()
        } else {
            serde_json::from_value(options.clone())
                .map_err(|e| AuthError::InvalidOptions(e.to_string()))?
        };
        self.load(parsed)
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.options.credentials.is_empty() {
            return Err(AuthError::InvalidOptions(
                "at least one credential is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for credential in &self.options.credentials {
            if credential.access_key_id.trim().is_empty() {
                return Err(AuthError::InvalidOptions(
                    "access_key_id must not be empty".to_string(),
                ));
            }
            if credential.secret.is_empty() {
                return Err(AuthError::InvalidOptions(format!(
                    "secret of {} must not be empty",
                    credential.access_key_id
                )));
            }
            if !seen.insert(credential.access_key_id.as_str()) {
                return Err(AuthError::InvalidOptions(format!(
                    "duplicate access_key_id: {}",
                    credential.access_key_id
                )));
            }
        }
        Ok(())
    }

    async fn authenticate(&self, access_key_id: &str, secret: &str) -> Result<bool, AuthError> {
        let Some(grant) = self.grants.get(access_key_id) else {
            debug!("Unknown access key {}", access_key_id);
            return Ok(false);
        };

        if is_hashed(&grant.secret) {
            return verify_secret(secret, &grant.secret).map_err(|e| {
                warn!("Stored secret for {} is unusable: {}", access_key_id, e);
                AuthError::Plugin(e.to_string())
            });
        }
        Ok(constant_time_eq(grant.secret.as_bytes(), secret.as_bytes()))
    }

    async fn has_permission(&self, access_key_id: &str, domain: &str) -> Result<bool, AuthError> {
        let Some(grant) = self.grants.get(access_key_id) else {
            return Ok(false);
        };
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        Ok(grant.patterns.iter().any(|p| p.matches(&domain)))
    }

    async fn close(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_secret;
    use serde_json::json;

    async fn plugin(options: serde_json::Value) -> Result<StaticPlugin, AuthError> {
        let mut plugin = StaticPlugin::default();
        plugin.setup(&options).await?;
        plugin.validate()?;
        Ok(plugin)
    }

    #[test]
    fn test_domain_pattern() {
        let exact = DomainPattern::parse("A.Example.com").unwrap();
        assert!(exact.matches("a.example.com"));
        assert!(!exact.matches("b.a.example.com"));

        let wildcard = DomainPattern::parse("*.example.com").unwrap();
        assert!(wildcard.matches("api.example.com"));
        assert!(!wildcard.matches("example.com"));
        assert!(!wildcard.matches("deep.api.example.com"));
        assert!(!wildcard.matches("apiexample.com"));

        assert!(DomainPattern::parse("*.*.example.com").is_err());
        assert!(DomainPattern::parse("api.*.example.com").is_err());
        assert!(DomainPattern::parse("*.com").is_err());
        assert!(DomainPattern::parse("").is_err());
    }

    #[tokio::test]
    async fn test_authenticate_plaintext_and_hashed() {
        let hashed = hash_secret("hashed-secret").unwrap();
        let plugin = plugin(json!({
            "credentials": [
                { "access_key_id": "plain", "secret": "s3cret", "domains": ["a.example.com"] },
                { "access_key_id": "hashed", "secret": hashed, "domains": [] }
            ]
        }))
        .await
        .unwrap();

        assert!(plugin.authenticate("plain", "s3cret").await.unwrap());
        assert!(!plugin.authenticate("plain", "wrong").await.unwrap());
        assert!(plugin.authenticate("hashed", "hashed-secret").await.unwrap());
        assert!(!plugin.authenticate("hashed", "s3cret").await.unwrap());
        assert!(!plugin.authenticate("nobody", "s3cret").await.unwrap());
    }

    #[tokio::test]
    async fn test_has_permission() {
        let plugin = plugin(json!({
            "credentials": [{
                "access_key_id": "key",
                "secret": "s",
                "domains": ["a.example.com", "*.b.example.com"]
            }]
        }))
        .await
        .unwrap();

        assert!(plugin.has_permission("key", "a.example.com").await.unwrap());
        assert!(plugin.has_permission("key", "A.Example.com.").await.unwrap());
        assert!(plugin.has_permission("key", "x.b.example.com").await.unwrap());
        assert!(!plugin.has_permission("key", "c.example.com").await.unwrap());
        assert!(!plugin.has_permission("other", "a.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_options() {
        assert!(plugin(json!({ "credentials": [] })).await.is_err());
        assert!(plugin(serde_json::Value::Null).await.is_err());
        assert!(plugin(json!({ "credentials": "nope" })).await.is_err());
        assert!(plugin(json!({
            "credentials": [
                { "access_key_id": "k", "secret": "a" },
                { "access_key_id": "k", "secret": "b" }
            ]
        }))
        .await
        .is_err());
        assert!(plugin(json!({
            "credentials": [{ "access_key_id": "k", "secret": "" }]
        }))
        .await
        .is_err());
        assert!(plugin(json!({
            "credentials": [{ "access_key_id": "k", "secret": "s", "domains": ["a.*.com"] }]
        }))
        .await
        .is_err());
    }

    #[test]
    fn test_from_options() {
        let options = StaticOptions {
            credentials: vec![StaticCredential {
                access_key_id: "k".to_string(),
                secret: "s".to_string(),
                domains: vec!["*.example.com".to_string()],
            }],
        };
        assert!(StaticPlugin::from_options(options).is_ok());
        assert!(StaticPlugin::from_options(StaticOptions::default()).is_err());
    }
}
