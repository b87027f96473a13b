//! Peer replication between backend nodes
//!
//! Every node dials every other member ([`PeerReplicator`]) and serves the
//! same exchange on its peer listener ([`PeerServer`]). Both sides stream
//! their upstream tables to each other and apply what they receive with the
//! registry's last-write-wins rule. The peer listener also forwards data
//! channels to sessions terminated on this node ([`dial_channel`]).

pub mod channel;
pub mod link;
pub mod replicator;
pub mod server;

use kun_connection::TransportError;
use kun_proto::{CodecError, RejectReason};
use thiserror::Error;

pub use channel::{dial_channel, RemoteChannel};
pub use link::{LinkMode, LinkStatus};
pub use replicator::{watch_upstream, PeerReplicator};
pub use server::PeerServer;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer rejected the link: {0}")]
    Rejected(String),

    #[error("Member is this node")]
    SelfLink,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer is not keeping up with replication")]
    SlowPeer,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote node refused the channel: {0}")]
    ChannelRejected(RejectReason),
}

impl From<CodecError> for PeerError {
    fn from(e: CodecError) -> Self {
        PeerError::Transport(TransportError::CodecError(e))
    }
}
