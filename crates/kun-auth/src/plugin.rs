//! Authentication plugin contract and the factory table plugins are built from

use crate::allow_all::AllowAllPlugin;
use crate::static_plugin::StaticPlugin;
use crate::AuthError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw, plugin-specific options (JSON object)
pub type PluginOptions = serde_json::Value;

/// Lifecycle of an authentication plugin: `setup` with its options,
/// `validate`, then serve `authenticate`/`has_permission` calls until `close`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// Load options; called once right after construction
    async fn setup(&mut self, options: &PluginOptions) -> Result<(), AuthError>;

    /// Check that the loaded configuration is usable
    fn validate(&self) -> Result<(), AuthError>;

    /// Whether `access_key_id`/`secret` are correct
    async fn authenticate(&self, access_key_id: &str, secret: &str) -> Result<bool, AuthError>;

    /// Whether the owner of `access_key_id` may register `domain`
    async fn has_permission(&self, access_key_id: &str, domain: &str) -> Result<bool, AuthError>;

    /// Release resources; must be safe after a failed `setup`
    async fn close(&self) -> Result<(), AuthError>;
}

/// Builds an unconfigured plugin
pub type PluginFactory = fn() -> Box<dyn AuthPlugin>;

/// Which plugin to use and its options (the `auth` configuration section)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthOptions {
    pub method: String,
    pub options: PluginOptions,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            method: StaticPlugin::NAME.to_string(),
            options: PluginOptions::Null,
        }
    }
}

/// Plugin factories keyed by upper-cased name.
///
/// Filled once during startup wiring and passed by reference afterwards.
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `STATIC` and `ALLOW_ALL` plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(StaticPlugin::NAME.to_string(), || {
            Box::new(StaticPlugin::default())
        });
        registry
            .factories
            .insert(AllowAllPlugin::NAME.to_string(), || Box::new(AllowAllPlugin));
        registry
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) -> Result<(), AuthError> {
        let key = name.to_ascii_uppercase();
        if self.factories.contains_key(&key) {
            return Err(AuthError::DuplicatePlugin(key));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_uppercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build, set up and validate the plugin selected by `options.method`
    pub async fn create(&self, options: &AuthOptions) -> Result<Arc<dyn AuthPlugin>, AuthError> {
        let key = options.method.to_ascii_uppercase();
        if key.is_empty() {
            return Err(AuthError::InvalidOptions("method is required".to_string()));
        }
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| AuthError::UnknownPlugin(key.clone()))?;

        let mut plugin = factory();
        let ready = match plugin.setup(&options.options).await {
            Ok(()) => plugin.validate(),
            Err(e) => Err(e),
        };

        if let Err(e) = ready {
            if let Err(close_err) = plugin.close().await {
                warn!("Closing auth plugin {} failed: {}", key, close_err);
            }
            return Err(e);
        }

        debug!("Auth plugin {} ready", key);
        Ok(Arc::from(plugin))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
