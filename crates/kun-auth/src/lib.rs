//! Authentication for kun
//!
//! Auth plugins are selected by name from a [`PluginRegistry`] filled during
//! startup. The [`Authenticator`] wraps the selected plugin and issues login
//! tokens.

pub mod allow_all;
pub mod authenticator;
pub mod jwt;
pub mod password;
pub mod plugin;
pub mod static_plugin;

use thiserror::Error;

pub use allow_all::AllowAllPlugin;
pub use authenticator::Authenticator;
pub use jwt::{JwtError, LoginClaims, TokenIssuer};
pub use password::{hash_secret, verify_secret, PasswordError};
pub use plugin::{AuthOptions, AuthPlugin, PluginFactory, PluginOptions, PluginRegistry};
pub use static_plugin::{DomainPattern, StaticCredential, StaticOptions, StaticPlugin};

pub use async_trait::async_trait;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Auth plugin {0} already registered")]
    DuplicatePlugin(String),

    #[error("Unknown auth plugin: {0}")]
    UnknownPlugin(String),

    #[error("Invalid auth options: {0}")]
    InvalidOptions(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Auth plugin error: {0}")]
    Plugin(String),
}
