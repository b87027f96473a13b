//! Live tunnel sessions of this node

use crate::session::{SessionConfig, TunnelSession};
use crate::SessionError;
use dashmap::DashMap;
use kun_auth::Authenticator;
use kun_connection::DataChannel;
use kun_proto::{TunnelEvent, TunnelMessage};
use kun_router::{RegistryEvent, UpstreamRegistry};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Identity of this backend node as recorded in upstream endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    /// Address other nodes use to reach our peer listener
    pub peer_addr: String,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            peer_addr: peer_addr.into(),
        }
    }
}

pub struct SessionManager {
    node: NodeInfo,
    config: SessionConfig,
    registry: Arc<UpstreamRegistry>,
    auth: Authenticator,
    sessions: DashMap<String, Arc<TunnelSession>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl SessionManager {
    pub fn new(
        node: NodeInfo,
        config: SessionConfig,
        registry: Arc<UpstreamRegistry>,
        auth: Authenticator,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node,
            config,
            registry,
            auth,
            sessions: DashMap::new(),
            events,
        }
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Track a new session for a client whose credentials were accepted
    pub fn create_session(
        &self,
        access_key_id: &str,
        remote_addr: &str,
    ) -> (Arc<TunnelSession>, mpsc::Receiver<TunnelMessage>) {
        let id = format!("session-{}", uuid::Uuid::new_v4().simple());
        let (session, outbound_rx) = TunnelSession::new(
            id.clone(),
            access_key_id.to_string(),
            remote_addr.to_string(),
            self.node.clone(),
            self.config.clone(),
            self.registry.clone(),
            self.auth.clone(),
            self.events.clone(),
        );
        self.sessions.insert(id, session.clone());
        session.mark_authenticated();
        info!(
            session_id = %session.id(),
            access_key_id = %access_key_id,
            remote_addr = %remote_addr,
            "Tunnel session created"
        );
        (session, outbound_rx)
    }

    /// Forget a session once it has closed
    pub fn remove(&self, session_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.remove(session_id).map(|(_, session)| session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session lifecycle feed
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Open a data channel on a local session
    pub async fn open_data_channel(
        &self,
        session_id: &str,
        domain: &str,
        remote_addr: &str,
    ) -> Result<DataChannel, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.open_data_channel(domain, remote_addr).await
    }

    /// Ask every session to close
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.close();
        }
    }

    /// Hand domains superseded in the registry back from the local sessions
    /// that lost them, until cancelled.
    pub async fn run_supervisor(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.registry.subscribe();
        debug!("Session supervisor started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => self.on_registry_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session supervisor lagged by {} events, reconciling", skipped);
                    self.reconcile();
                }
                Err(RecvError::Closed) => break,
            }
        }

        debug!("Session supervisor stopped");
    }

    fn on_registry_event(&self, event: &RegistryEvent) {
        let Some(lost) = event.superseded_endpoint() else {
            return;
        };
        if lost.node_id != self.node.node_id {
            return;
        }
        if let Some(session) = self.get(&lost.session_id) {
            session.supersede(event.domain());
        }
    }

    /// Compare every session's domains with the registry
    fn reconcile(&self) {
        for session in self.sessions() {
            for domain in session.owned_domains() {
                let taken = self
                    .registry
                    .get(&domain)
                    .is_some_and(|r| !r.is_owned_by(session.id()));
                if taken {
                    session.supersede(&domain);
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("node", &self.node)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
