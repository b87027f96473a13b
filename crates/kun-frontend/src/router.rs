//! Domain lookup and channel setup for public connections

use crate::FrontendError;
use kun_connection::{relay, splice, DataChannel, Dialer, RelayStats};
use kun_control::{SessionError, SessionManager};
use kun_peer::{dial_channel, PeerError, RemoteChannel};
use kun_proto::RejectReason;
use kun_router::UpstreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Close a relayed connection after this long without traffic
    pub idle_timeout: Duration,
    /// Time allowed for the routing key to arrive
    pub read_timeout: Duration,
    /// Largest request head read while looking for the Host header
    pub max_head_size: usize,
    /// Time allowed to open a channel on the owning session
    pub open_timeout: Duration,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(300),
            max_head_size: 64 * 1024,
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the bytes of one public connection go
pub enum Upstream {
    /// Data channel on a session terminated on this node
    Local(DataChannel),
    /// Raw stream through the owning node's peer listener
    Remote(RemoteChannel),
}

pub struct FrontendRouter {
    registry: Arc<UpstreamRegistry>,
    manager: Arc<SessionManager>,
    dialer: Dialer,
    config: FrontendConfig,
}

impl FrontendRouter {
    /// `dialer` reaches the peer listeners of other nodes
    pub fn new(manager: Arc<SessionManager>, dialer: Dialer, config: FrontendConfig) -> Self {
        Self {
            registry: manager.registry().clone(),
            manager,
            dialer,
            config,
        }
    }

    pub fn config(&self) -> &FrontendConfig {
        &self.config
    }

    /// Open a path to the session serving `domain`.
    ///
    /// A record whose session vanished between lookup and open is reported
    /// as `RouteNotFound`; no other session is tried.
    pub async fn open(&self, domain: &str, remote_addr: &str) -> Result<Upstream, FrontendError> {
        let record = self
            .registry
            .lookup(domain)
            .ok_or_else(|| FrontendError::RouteNotFound(domain.to_string()))?;
        let endpoint = &record.endpoint;

        if endpoint.node_id == self.manager.node().node_id {
            let open = self
                .manager
                .open_data_channel(&endpoint.session_id, domain, remote_addr);
            return match tokio::time::timeout(self.config.open_timeout, open).await {
                Ok(Ok(channel)) => Ok(Upstream::Local(channel)),
                Ok(Err(
                    SessionError::NotFound(_) | SessionError::NotActive | SessionError::Closed,
                )) => {
                    debug!(domain = %domain, session_id = %endpoint.session_id, "Stale route");
                    Err(FrontendError::RouteNotFound(domain.to_string()))
                }
                Ok(Err(e)) => Err(FrontendError::Upstream(e.to_string())),
                Err(_) => Err(FrontendError::Upstream(format!(
                    "session {} did not accept a channel in time",
                    endpoint.session_id
                ))),
            };
        }

        match dial_channel(
            &self.dialer,
            &endpoint.peer_addr,
            &endpoint.session_id,
            domain,
            remote_addr,
            self.config.open_timeout,
        )
        .await
        {
            Ok(remote) => Ok(Upstream::Remote(remote)),
            Err(PeerError::ChannelRejected(RejectReason::SessionNotActive)) => {
                debug!(domain = %domain, node_id = %endpoint.node_id, "Stale remote route");
                Err(FrontendError::RouteNotFound(domain.to_string()))
            }
            Err(e) => Err(FrontendError::Upstream(format!(
                "node {} ({}): {}",
                endpoint.node_id, endpoint.peer_addr, e
            ))),
        }
    }

    /// Relay `client` to `upstream` after sending the bytes already read from it
    pub async fn forward<S>(
        &self,
        mut client: S,
        initial: &[u8],
        upstream: Upstream,
    ) -> Result<RelayStats, FrontendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match upstream {
            Upstream::Local(mut channel) => {
                if !initial.is_empty() {
                    channel
                        .write(initial)
                        .await
                        .map_err(|e| FrontendError::Upstream(e.to_string()))?;
                }
                Ok(relay(client, channel, self.config.idle_timeout).await)
            }
            Upstream::Remote(RemoteChannel {
                mut stream,
                leftover,
            }) => {
                if !initial.is_empty() {
                    stream
                        .write_all(initial)
                        .await
                        .map_err(|e| FrontendError::Upstream(e.to_string()))?;
                }
                if !leftover.is_empty() {
                    client.write_all(&leftover).await?;
                }
                Ok(splice(client, stream, self.config.idle_timeout).await)
            }
        }
    }
}
