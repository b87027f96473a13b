//! Tunnel client library
//!
//! Connects to a backend, registers domains and relays every data channel
//! the backend opens to a local TCP service.

pub mod client;
pub mod config;

use kun_connection::TransportError;
use kun_proto::{CodecError, RejectReason};
use thiserror::Error;

pub use client::{run_with_reconnect, TunnelConnection, TunnelConnector};
pub use config::{ClientConfig, ClientConfigBuilder};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Rejected by server ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("No domain could be registered: {0:?}")]
    NoDomainRegistered(Vec<(String, RejectReason)>),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server closed the session: {0}")]
    ClosedByServer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Transport(TransportError::CodecError(e))
    }
}

impl ClientError {
    /// Whether reconnecting can help
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::InvalidConfig(_) => false,
            // Domains held by another client free up once it leaves
            ClientError::NoDomainRegistered(rejected) => rejected
                .iter()
                .any(|(_, reason)| *reason == RejectReason::DomainInUse),
            ClientError::Rejected { reason, .. } => !matches!(
                reason,
                RejectReason::AuthFailed | RejectReason::PermissionDenied
            ),
            _ => true,
        }
    }
}
