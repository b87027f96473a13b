//! One authenticated client connection and the data channels multiplexed over it

use crate::manager::NodeInfo;
use crate::SessionError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use kun_auth::Authenticator;
use kun_connection::{ChannelMux, DataChannel, MessageStream};
use kun_proto::{
    Endpoint, RejectReason, TunnelEvent, TunnelEventKind, TunnelMessage, UpstreamRecord,
    DEFAULT_CHANNEL_WINDOW,
};
use kun_router::{normalize_domain, validate_domain, UpsertOutcome, UpstreamRegistry};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Connection accepted, identity not yet established
    Connecting,
    /// Credentials accepted, no domain registered yet
    Authenticated,
    /// At least one domain accepted
    Registered,
    /// Registration acknowledged; data channels flow
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_register(self) -> bool {
        matches!(
            self,
            SessionState::Authenticated | SessionState::Registered | SessionState::Active
        )
    }

    pub fn can_open_channels(self) -> bool {
        matches!(self, SessionState::Registered | SessionState::Active)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval the client is asked to heartbeat at
    pub heartbeat_interval: Duration,
    /// Silence after which the session is closed
    pub heartbeat_timeout: Duration,
    /// Lifetime of an upstream record between heartbeats
    pub record_ttl: Duration,
    /// Initial send window granted per data channel
    pub channel_window: u32,
    /// Capacity of the outbound frame queue
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            record_ttl: Duration::from_secs(60),
            channel_window: DEFAULT_CHANNEL_WINDOW,
            outbound_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.record_ttl).unwrap_or(ChronoDuration::seconds(60))
    }
}

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TunnelSession {
    id: String,
    access_key_id: String,
    remote_addr: String,
    node: NodeInfo,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    owned: Mutex<BTreeSet<String>>,
    mux: ChannelMux,
    outbound: mpsc::Sender<TunnelMessage>,
    registry: Arc<UpstreamRegistry>,
    auth: Authenticator,
    events: broadcast::Sender<TunnelEvent>,
    cancel: CancellationToken,
}

impl TunnelSession {
    /// Create a session in `Connecting` state.
    ///
    /// Returns the receiving end of the outbound frame queue; [`run`](Self::run)
    /// drains it into the connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        access_key_id: String,
        remote_addr: String,
        node: NodeInfo,
        config: SessionConfig,
        registry: Arc<UpstreamRegistry>,
        auth: Authenticator,
        events: broadcast::Sender<TunnelEvent>,
    ) -> (Arc<Self>, mpsc::Receiver<TunnelMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let mux = ChannelMux::new(outbound.clone(), config.channel_window);
        let (state, _) = watch::channel(SessionState::Connecting);

        let session = Arc::new(Self {
            id,
            access_key_id,
            remote_addr,
            node,
            config,
            state,
            owned: Mutex::new(BTreeSet::new()),
            mux,
            outbound,
            registry,
            auth,
            events,
            cancel: CancellationToken::new(),
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn owned_domains(&self) -> Vec<String> {
        self.owned().iter().cloned().collect()
    }

    pub fn owns(&self, domain: &str) -> bool {
        self.owned().contains(domain)
    }

    pub fn channel_count(&self) -> usize {
        self.mux.len()
    }

    fn owned(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.owned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Move forward to `next`; never moves backwards
    fn advance(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_authenticated(&self) {
        self.advance(SessionState::Authenticated);
        self.publish(TunnelEventKind::Connected);
    }

    fn publish(&self, kind: TunnelEventKind) {
        let _ = self
            .events
            .send(TunnelEvent::new(&self.id, &self.access_key_id, kind));
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.node.node_id, &self.node.peer_addr, &self.id)
    }

    /// Claim `domain` for this session and publish it to the registry.
    ///
    /// Idempotent for a domain this session already holds. Returns the new
    /// expiry of the record.
    pub async fn register_domain(&self, domain: &str) -> Result<DateTime<Utc>, SessionError> {
        if !self.state().can_register() {
            return Err(SessionError::NotActive);
        }

        let domain =
            validate_domain(domain).map_err(|e| SessionError::InvalidDomain(e.to_string()))?;

        if !self.auth.has_permission(&self.access_key_id, &domain).await? {
            info!(
                session_id = %self.id,
                access_key_id = %self.access_key_id,
                domain = %domain,
                "Domain registration denied"
            );
            return Err(SessionError::PermissionDenied(domain));
        }

        let now = Utc::now();
        if let Some(existing) = self.registry.lookup_at(&domain, now) {
            if !existing.is_owned_by(&self.id) {
                return Err(SessionError::DomainInUse(domain));
            }
            // Already ours: behave like a heartbeat for this domain
            let refreshed = self
                .registry
                .refresh(&domain, &self.id, now, self.config.ttl());
            return Ok(refreshed.map_or(existing.expired_at, |r| r.expired_at));
        }

        let record = UpstreamRecord::new(&domain, self.endpoint(), now, self.config.ttl());
        let expired_at = record.expired_at;
        if let UpsertOutcome::Stale = self.registry.upsert(record) {
            return Err(SessionError::DomainInUse(domain));
        }

        self.owned().insert(domain.clone());
        self.advance(SessionState::Registered);
        info!(session_id = %self.id, domain = %domain, "Domain registered");
        self.publish(TunnelEventKind::DomainRegistered(domain));
        Ok(expired_at)
    }

    /// Open a data channel for an inbound connection to `domain`
    pub async fn open_data_channel(
        &self,
        domain: &str,
        remote_addr: &str,
    ) -> Result<DataChannel, SessionError> {
        if !self.state().can_open_channels() || !self.owns(domain) {
            return Err(SessionError::NotActive);
        }

        let channel = self.mux.open()?;
        self.outbound
            .send(TunnelMessage::OpenChannel {
                stream_id: channel.stream_id(),
                domain: domain.to_string(),
                remote_addr: remote_addr.to_string(),
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        debug!(
            session_id = %self.id,
            stream_id = channel.stream_id(),
            domain = %domain,
            "Opened data channel"
        );
        Ok(channel)
    }

    /// Refresh every owned domain; domains lost to a newer registration are
    /// released and reported to the client.
    pub fn heartbeat(&self) {
        let now = Utc::now();
        let ttl = self.config.ttl();

        for domain in self.owned_domains() {
            if self.registry.refresh(&domain, &self.id, now, ttl).is_some() {
                continue;
            }
            match self.registry.get(&domain) {
                Some(record) if record.is_owned_by(&self.id) => {}
                Some(_) => self.supersede(&domain),
                None => {
                    // Swept while we still hold it
                    let record = UpstreamRecord::new(&domain, self.endpoint(), now, ttl);
                    if !self.registry.upsert(record).is_applied() {
                        self.supersede(&domain);
                    }
                }
            }
        }
    }

    /// Drop ownership of `domain` after another session took it over
    pub fn supersede(&self, domain: &str) {
        if !self.owned().remove(domain) {
            return;
        }
        warn!(
            session_id = %self.id,
            domain = %domain,
            "Domain superseded by a newer registration"
        );
        self.publish(TunnelEventKind::DomainReleased(domain.to_string()));
        self.queue(TunnelMessage::DomainSuperseded {
            domain: domain.to_string(),
        });
    }

    /// Queue a control frame without waiting for space. A full queue means
    /// the client stopped reading, so the session is closed instead.
    fn queue(&self, msg: TunnelMessage) -> bool {
        match self.outbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Outbound queue full, closing session");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the session to close; `run` performs the teardown
    pub fn close(&self) {
        self.advance(SessionState::Closing);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Wait until the session reached `Closed`
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Serve the session until the client leaves, a transport error occurs,
    /// the heartbeat times out or [`close`](Self::close) is called.
    pub async fn run(
        self: Arc<Self>,
        stream: MessageStream<TunnelMessage>,
        outbound_rx: mpsc::Receiver<TunnelMessage>,
    ) {
        let (sink, mut source) = stream.split();
        let writer_done = CancellationToken::new();
        let timeout = self.config.heartbeat_timeout;
        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            writer_done.clone(),
            self.cancel.clone(),
            timeout,
        ));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let reason: Option<String> = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Some("server closing".to_string()),
                _ = &mut deadline => {
                    warn!(session_id = %self.id, "Heartbeat timeout after {:?}", timeout);
                    break Some("heartbeat timeout".to_string());
                }
                msg = source.next() => match msg {
                    Some(Ok(TunnelMessage::Heartbeat { timestamp })) => {
                        deadline.as_mut().reset(Instant::now() + timeout);
                        self.heartbeat();
                        self.queue(TunnelMessage::HeartbeatAck { timestamp });
                    }
                    Some(Ok(TunnelMessage::Close { reason })) => {
                        info!(session_id = %self.id, "Client closed session: {}", reason);
                        break None;
                    }
                    Some(Ok(msg)) => {
                        if let Err(reason) = self.handle_message(msg).await {
                            break Some(reason);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %self.id, "Transport error: {}", e);
                        break None;
                    }
                    None => {
                        debug!(session_id = %self.id, "Connection closed by client");
                        break None;
                    }
                }
            }
        };

        self.shutdown(reason);

        writer_done.cancel();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            debug!(session_id = %self.id, "Writer did not drain in time");
            writer.abort();
        }
        self.advance(SessionState::Closed);
        info!(session_id = %self.id, "Session closed");
    }

    /// Returns the close reason when the message ends the session
    async fn handle_message(&self, msg: TunnelMessage) -> Result<(), String> {
        match msg {
            TunnelMessage::RegisterDomain { domain } => {
                let reply = match self.register_domain(&domain).await {
                    Ok(expired_at) => TunnelMessage::DomainRegistered {
                        domain: normalize_domain(&domain),
                        expired_at,
                    },
                    Err(e) => {
                        debug!(session_id = %self.id, domain = %domain, "Registration rejected: {}", e);
                        TunnelMessage::DomainRejected {
                            domain,
                            reason: e.reject_reason(),
                            message: e.to_string(),
                        }
                    }
                };
                let registered = matches!(reply, TunnelMessage::DomainRegistered { .. });
                if !self.queue(reply) {
                    return Err("client not reading".to_string());
                }
                if registered {
                    self.advance(SessionState::Active);
                }
                Ok(())
            }
            TunnelMessage::Data { stream_id, data } => {
                if let Err(e) = self.mux.on_data(stream_id, data) {
                    warn!(session_id = %self.id, "Reset data channel: {}", e);
                }
                Ok(())
            }
            TunnelMessage::WindowUpdate { stream_id, credit } => {
                self.mux.on_window_update(stream_id, credit);
                Ok(())
            }
            TunnelMessage::CloseChannel { stream_id } => {
                self.mux.on_close(stream_id);
                Ok(())
            }
            other => {
                warn!(session_id = %self.id, "Unexpected message: {:?}", other);
                self.queue(TunnelMessage::rejected(
                    RejectReason::ProtocolError,
                    "unexpected message",
                ));
                Err("protocol error".to_string())
            }
        }
    }

    /// Release channels and owned domains. The registry removal only touches
    /// records this session still owns.
    fn shutdown(&self, reason: Option<String>) {
        self.advance(SessionState::Closing);
        self.mux.close_all();

        let domains: Vec<String> = std::mem::take(&mut *self.owned()).into_iter().collect();
        for domain in domains {
            if self.registry.remove(&domain, &self.id).is_some() {
                debug!(session_id = %self.id, domain = %domain, "Released domain");
            }
            self.publish(TunnelEventKind::DomainReleased(domain));
        }
        self.publish(TunnelEventKind::Closed);

        if let Some(reason) = reason {
            let _ = self.outbound.try_send(TunnelMessage::Close { reason });
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("access_key_id", &self.access_key_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Forward queued frames to the connection. After `done` fires, whatever is
/// already queued is flushed and the sink closed.
///
/// A failed write, or one blocked for longer than `stall`, cancels the session.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<TunnelMessage>,
    done: CancellationToken,
    session: CancellationToken,
    stall: Duration,
) where
    S: futures::Sink<TunnelMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = done.cancelled() => None,
        };
        let Some(msg) = msg else { break };
        match tokio::time::timeout(stall, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Session writer stopped: {}", e);
                session.cancel();
                return;
            }
            Err(_) => {
                warn!("Session writer blocked for {:?}, closing session", stall);
                session.cancel();
                return;
            }
        }
    }

    while let Ok(msg) = rx.try_recv() {
        if sink.feed(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}
