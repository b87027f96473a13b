//! Public frontend: route inbound HTTP(S) connections to tunnel sessions
//!
//! The routing key is the Host header for plain HTTP, the SNI (or the Host
//! header when the client sent none) for terminated HTTPS, and the SNI of
//! the ClientHello for TLS passthrough. A domain owned by a session on this
//! node gets a local data channel; one owned elsewhere in the cluster is
//! forwarded through the owning node's peer listener.

pub mod response;
pub mod router;
pub mod server;

use thiserror::Error;

pub use response::error_response;
pub use router::{FrontendConfig, FrontendRouter, Upstream};
pub use server::{FrontendServer, ListenerMode};

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No live record, or the record points at a session that is gone
    #[error("No tunnel for {0}")]
    RouteNotFound(String),

    #[error("Upstream failed: {0}")]
    Upstream(String),

    #[error("Timed out reading the request")]
    Timeout,

    #[error("Client closed the connection")]
    ClientClosed,
}

impl FrontendError {
    /// Status line for errors reported to HTTP clients
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            FrontendError::BadRequest(_) => Some((400, "Bad Request")),
            FrontendError::Timeout => Some((408, "Request Timeout")),
            FrontendError::RouteNotFound(_) | FrontendError::Upstream(_) => {
                Some((502, "Bad Gateway"))
            }
            _ => None,
        }
    }
}
