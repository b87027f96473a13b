//! Outbound replication links to every configured member

use crate::link::{run_link, LinkMode, LinkStatus};
use crate::PeerError;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kun_connection::{framed, Backoff, BackoffConfig, Dialer, MessageStream};
use kun_proto::PeerMessage;
use kun_router::UpstreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeps one duplex link open to every other cluster member
pub struct PeerReplicator {
    node_id: String,
    members: Vec<String>,
    registry: Arc<UpstreamRegistry>,
    dialer: Dialer,
    backoff: BackoffConfig,
    handshake_timeout: Duration,
    links: DashMap<String, Arc<LinkStatus>>,
}

impl PeerReplicator {
    pub fn new(
        node_id: impl Into<String>,
        members: Vec<String>,
        registry: Arc<UpstreamRegistry>,
        dialer: Dialer,
    ) -> Self {
        let mut unique = Vec::with_capacity(members.len());
        for member in members {
            let member = member.trim().to_string();
            if !member.is_empty() && !unique.contains(&member) {
                unique.push(member);
            }
        }

        Self {
            node_id: node_id.into(),
            members: unique,
            registry,
            dialer,
            backoff: BackoffConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            links: DashMap::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Status of every member still being linked, keyed by member URL
    pub fn links(&self) -> Vec<(String, Arc<LinkStatus>)> {
        self.links
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn link(&self, member: &str) -> Option<Arc<LinkStatus>> {
        self.links.get(member).map(|status| status.clone())
    }

    /// Run one reconnecting link per member until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Peer replicator {} starting with {} member(s)",
            self.node_id,
            self.members.len()
        );

        let mut tasks = JoinSet::new();
        for member in self.members.clone() {
            let status = Arc::new(LinkStatus::default());
            self.links.insert(member.clone(), status.clone());
            tasks.spawn(self.clone().member_loop(member, status, cancel.clone()));
        }

        while tasks.join_next().await.is_some() {}
        info!("Peer replicator stopped");
    }

    async fn member_loop(
        self: Arc<Self>,
        member: String,
        status: Arc<LinkStatus>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            match self.connect(&member, &cancel).await {
                Ok(Some((conn, remote))) => {
                    info!("Replication link to {} ({}) established", member, remote);
                    backoff.reset();
                    status.set_remote_node(&remote);
                    status.set_connected(true);
                    let result =
                        run_link(conn, &self.registry, &status, LinkMode::Duplex, &cancel).await;
                    status.set_connected(false);
                    match result {
                        Ok(()) => debug!("Replication link to {} closed", member),
                        Err(e) => warn!("Replication link to {} failed: {}", member, e),
                    }
                }
                Ok(None) => return,
                Err(PeerError::SelfLink) => {
                    debug!("Member {} is this node, not linking", member);
                    self.links.remove(&member);
                    return;
                }
                Err(e) => warn!("Failed to link to member {}: {}", member, e),
            }

            if cancel.is_cancelled() || backoff.wait(&cancel).await.is_err() {
                return;
            }
        }
    }

    /// Dial and handshake; `Ok(None)` means cancelled
    async fn connect(
        &self,
        member: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<(MessageStream<PeerMessage>, String)>, PeerError> {
        let handshake = async {
            let stream = self.dialer.dial(member).await?;
            let mut conn = framed::<PeerMessage>(stream);
            conn.send(PeerMessage::ConnectUpstream {
                node_id: self.node_id.clone(),
            })
            .await?;
            let remote = expect_accepted(&mut conn, self.handshake_timeout).await?;
            Ok::<_, PeerError>((conn, remote))
        };

        let (conn, remote) = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = handshake => result?,
        };

        if remote == self.node_id {
            return Err(PeerError::SelfLink);
        }
        Ok(Some((conn, remote)))
    }
}

impl std::fmt::Debug for PeerReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerReplicator")
            .field("node_id", &self.node_id)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn expect_accepted(
    conn: &mut MessageStream<PeerMessage>,
    timeout: Duration,
) -> Result<String, PeerError> {
    match tokio::time::timeout(timeout, conn.next()).await {
        Err(_) => Err(PeerError::HandshakeTimeout),
        Ok(None) => Err(PeerError::ConnectionClosed),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(PeerMessage::Accepted { node_id }))) => Ok(node_id),
        Ok(Some(Ok(PeerMessage::Rejected { message }))) => Err(PeerError::Rejected(message)),
        Ok(Some(Ok(other))) => Err(PeerError::Protocol(format!(
            "expected Accepted, got {:?}",
            other
        ))),
    }
}

/// Mirror a remote node's upstream table into `registry` without sending ours.
///
/// Returns when the remote closes the stream or `cancel` fires.
pub async fn watch_upstream(
    dialer: &Dialer,
    url: &str,
    node_id: &str,
    registry: &UpstreamRegistry,
    status: &LinkStatus,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    let stream = dialer.dial(url).await?;
    let mut conn = framed::<PeerMessage>(stream);
    conn.send(PeerMessage::WatchUpstream {
        node_id: node_id.to_string(),
    })
    .await?;
    let remote = expect_accepted(&mut conn, DEFAULT_HANDSHAKE_TIMEOUT).await?;

    debug!("Watching upstream table of {}", remote);
    status.set_remote_node(&remote);
    status.set_connected(true);
    let result = run_link(conn, registry, status, LinkMode::ReceiveOnly, cancel).await;
    status.set_connected(false);
    result
}
