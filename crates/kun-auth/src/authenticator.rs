//! Facade the control server uses for login, connect and registration checks

use crate::jwt::{JwtError, TokenIssuer};
use crate::plugin::AuthPlugin;
use crate::AuthError;
use chrono::{DateTime, Utc};
use kun_proto::Credentials;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Authenticator {
    plugin: Arc<dyn AuthPlugin>,
    tokens: TokenIssuer,
}

impl Authenticator {
    pub fn new(plugin: Arc<dyn AuthPlugin>, tokens: TokenIssuer) -> Self {
        Self { plugin, tokens }
    }

    pub fn plugin(&self) -> &Arc<dyn AuthPlugin> {
        &self.plugin
    }

    /// Exchange an access key and secret for a login token
    pub async fn login(
        &self,
        access_key_id: &str,
        secret: &str,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        if !self.plugin.authenticate(access_key_id, secret).await? {
            debug!("Login rejected for {}", access_key_id);
            return Err(AuthError::AuthFailed);
        }
        self.tokens
            .issue(access_key_id)
            .map_err(|e| AuthError::Token(e.to_string()))
    }

    /// Resolve the access key id behind connect credentials
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError> {
        match credentials {
            Credentials::AccessKey {
                access_key_id,
                secret,
            } => {
                if self.plugin.authenticate(access_key_id, secret).await? {
                    Ok(access_key_id.clone())
                } else {
                    Err(AuthError::AuthFailed)
                }
            }
            Credentials::Token(token) => match self.tokens.verify(token) {
                Ok(claims) => Ok(claims.sub),
                Err(JwtError::Expired) => {
                    debug!("Expired login token presented");
                    Err(AuthError::AuthFailed)
                }
                Err(e) => {
                    warn!("Invalid login token: {}", e);
                    Err(AuthError::AuthFailed)
                }
            },
        }
    }

    pub async fn has_permission(&self, access_key_id: &str, domain: &str) -> Result<bool, AuthError> {
        self.plugin.has_permission(access_key_id, domain).await
    }

    pub async fn close(&self) -> Result<(), AuthError> {
        self.plugin.close().await
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}
