//! Data channels forwarded to a session terminated on another node

use crate::PeerError;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use kun_connection::{framed, BoxedStream, Dialer};
use kun_proto::PeerMessage;
use std::time::Duration;
use tracing::debug;

/// A raw byte stream to a remote session's data channel
pub struct RemoteChannel {
    pub stream: BoxedStream,
    /// Bytes that arrived behind `ChannelOpened`; they belong to the client
    pub leftover: BytesMut,
}

/// Ask the node at `peer_addr` to open a data channel on `session_id`
pub async fn dial_channel(
    dialer: &Dialer,
    peer_addr: &str,
    session_id: &str,
    domain: &str,
    remote_addr: &str,
    timeout: Duration,
) -> Result<RemoteChannel, PeerError> {
    let stream = dialer.dial(peer_addr).await?;
    let mut conn = framed::<PeerMessage>(stream);
    conn.send(PeerMessage::OpenChannel {
        session_id: session_id.to_string(),
        domain: domain.to_string(),
        remote_addr: remote_addr.to_string(),
    })
    .await?;

    let reply = match tokio::time::timeout(timeout, conn.next()).await {
        Err(_) => return Err(PeerError::HandshakeTimeout),
        Ok(None) => return Err(PeerError::ConnectionClosed),
        Ok(Some(reply)) => reply?,
    };

    match reply {
        PeerMessage::ChannelOpened => {
            debug!("Remote channel to {} for {} opened", peer_addr, domain);
            let parts = conn.into_parts();
            Ok(RemoteChannel {
                stream: parts.io,
                leftover: parts.read_buf,
            })
        }
        PeerMessage::ChannelRejected { reason } => Err(PeerError::ChannelRejected(reason)),
        PeerMessage::Rejected { message } => Err(PeerError::Rejected(message)),
        other => Err(PeerError::Protocol(format!(
            "expected ChannelOpened, got {:?}",
            other
        ))),
    }
}
