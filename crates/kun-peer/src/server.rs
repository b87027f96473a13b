//! Peer listener: inbound replication links and forwarded data channels

use crate::link::{run_link, LinkMode, LinkStatus};
use crate::PeerError;
use futures::{SinkExt, StreamExt};
use kun_connection::{accept_stream, framed, relay, BoxedStream, MessageStream};
use kun_control::SessionManager;
use kun_proto::PeerMessage;
use kun_router::UpstreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct PeerServer {
    node_id: String,
    registry: Arc<UpstreamRegistry>,
    manager: Arc<SessionManager>,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    relay_idle_timeout: Duration,
}

impl PeerServer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            node_id: manager.node().node_id.clone(),
            registry: manager.registry().clone(),
            manager,
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            relay_idle_timeout: DEFAULT_RELAY_IDLE_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_relay_idle_timeout(mut self, timeout: Duration) -> Self {
        self.relay_idle_timeout = timeout;
        self
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, PeerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| PeerError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Peer server {} listening on {}", self.node_id, addr);
        }

        loop {
            let (tcp, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept peer connection: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let stream =
                    match accept_stream(tcp, server.tls.as_ref(), server.handshake_timeout).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!("Peer connection from {} failed: {}", remote, e);
                            return;
                        }
                    };
                if let Err(e) = server.handle_connection(stream, cancel).await {
                    debug!("Peer connection from {} ended: {}", remote, e);
                }
            });
        }

        info!("Peer server stopped");
    }

    pub async fn handle_connection(
        &self,
        stream: BoxedStream,
        cancel: CancellationToken,
    ) -> Result<(), PeerError> {
        let mut conn = framed::<PeerMessage>(stream);

        let first = match tokio::time::timeout(self.handshake_timeout, conn.next()).await {
            Err(_) => return Err(PeerError::HandshakeTimeout),
            Ok(None) => return Err(PeerError::ConnectionClosed),
            Ok(Some(msg)) => msg?,
        };

        match first {
            PeerMessage::ConnectUpstream { node_id } => {
                conn.send(PeerMessage::Accepted {
                    node_id: self.node_id.clone(),
                })
                .await?;
                if node_id == self.node_id {
                    // The dialer sees our id and gives up
                    return Ok(());
                }
                info!("Replication link from {} accepted", node_id);
                let status = LinkStatus::default();
                status.set_remote_node(&node_id);
                status.set_connected(true);
                run_link(conn, &self.registry, &status, LinkMode::Duplex, &cancel).await
            }
            PeerMessage::WatchUpstream { node_id } => {
                conn.send(PeerMessage::Accepted {
                    node_id: self.node_id.clone(),
                })
                .await?;
                debug!("{} is watching the upstream table", node_id);
                let status = LinkStatus::default();
                status.set_remote_node(&node_id);
                run_link(conn, &self.registry, &status, LinkMode::SendOnly, &cancel).await
            }
            PeerMessage::OpenChannel {
                session_id,
                domain,
                remote_addr,
            } => {
                self.forward_channel(conn, &session_id, &domain, &remote_addr)
                    .await
            }
            other => {
                warn!("Unexpected first peer message: {:?}", other);
                conn.send(PeerMessage::Rejected {
                    message: "expected ConnectUpstream, WatchUpstream or OpenChannel".to_string(),
                })
                .await?;
                Err(PeerError::Protocol("unexpected first message".to_string()))
            }
        }
    }

    async fn forward_channel(
        &self,
        mut conn: MessageStream<PeerMessage>,
        session_id: &str,
        domain: &str,
        remote_addr: &str,
    ) -> Result<(), PeerError> {
        let mut channel = match self
            .manager
            .open_data_channel(session_id, domain, remote_addr)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                debug!(session_id = %session_id, domain = %domain, "Refusing forwarded channel: {}", e);
                conn.send(PeerMessage::ChannelRejected {
                    reason: e.reject_reason(),
                })
                .await?;
                return Ok(());
            }
        };

        conn.send(PeerMessage::ChannelOpened).await?;

        // Bytes the frontend sent right behind OpenChannel may already sit in
        // the codec's read buffer
        let parts = conn.into_parts();
        if !parts.read_buf.is_empty() {
            if let Err(e) = channel.write(&parts.read_buf).await {
                debug!("Forwarded channel closed before relay: {}", e);
                return Ok(());
            }
        }

        let stats = relay(parts.io, channel, self.relay_idle_timeout).await;
        debug!(
            session_id = %session_id,
            domain = %domain,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Forwarded channel finished ({:?})",
            stats.end
        );
        Ok(())
    }
}
