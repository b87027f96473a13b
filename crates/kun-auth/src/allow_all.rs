//! Plugin that accepts every credential. For development only.

use crate::plugin::{AuthPlugin, PluginOptions};
use crate::AuthError;
use async_trait::async_trait;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPlugin;

impl AllowAllPlugin {
    pub const NAME: &'static str = "ALLOW_ALL";
}

#[async_trait]
impl AuthPlugin for AllowAllPlugin {
    async fn setup(&mut self, _options: &PluginOptions) -> Result<(), AuthError> {
        warn!("ALLOW_ALL auth plugin enabled: every client may register any domain");
        Ok(())
    }

    fn validate(&self) -> Result<(), AuthError> {
        Ok(())
    }

    async fn authenticate(&self, _access_key_id: &str, _secret: &str) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn has_permission(&self, _access_key_id: &str, _domain: &str) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn close(&self) -> Result<(), AuthError> {
        Ok(())
    }
}
