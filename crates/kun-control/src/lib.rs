//! Backend control plane
//!
//! [`TunnelSession`] is one authenticated client connection multiplexing
//! data channels; [`SessionManager`] owns the live sessions of this node;
//! [`BackendControlServer`] accepts client connections and dispatches the
//! `Login`, `Connect` and `WatchTunnels` calls.

pub mod manager;
pub mod server;
pub mod session;

use kun_auth::AuthError;
use kun_connection::{ChannelError, TransportError};
use kun_proto::RejectReason;
use thiserror::Error;

pub use manager::{NodeInfo, SessionManager};
pub use server::BackendControlServer;
pub use session::{SessionConfig, SessionState, TunnelSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Permission denied for domain {0}")]
    PermissionDenied(String),

    #[error("Domain {0} is in use by another session")]
    DomainInUse(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Session not active")]
    NotActive,

    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Session closed")]
    Closed,

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SessionError {
    /// Reason reported to the client or to a remote frontend
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            SessionError::PermissionDenied(_) => RejectReason::PermissionDenied,
            SessionError::DomainInUse(_) => RejectReason::DomainInUse,
            SessionError::InvalidDomain(_) => RejectReason::InvalidDomain,
            SessionError::NotActive | SessionError::NotFound(_) | SessionError::Closed => {
                RejectReason::SessionNotActive
            }
            SessionError::Channel(_) => RejectReason::SessionNotActive,
            SessionError::Auth(AuthError::AuthFailed) => RejectReason::AuthFailed,
            SessionError::Auth(_) => RejectReason::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}
