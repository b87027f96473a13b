//! Backend control listener: login, tunnel sessions and the watch feed

use crate::manager::SessionManager;
use crate::ControlError;
use futures::{SinkExt, StreamExt};
use kun_auth::AuthError;
use kun_connection::{accept_stream, framed, BoxedStream, MessageStream};
use kun_proto::{Credentials, RejectReason, TunnelEvent, TunnelEventKind, TunnelMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BackendControlServer {
    manager: Arc<SessionManager>,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl BackendControlServer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
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

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, ControlError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ControlError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accept connections until `cancel` fires, then close every session
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ControlError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Backend control server listening on {}", addr);
        }

        loop {
            let (tcp, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let stream = match accept_stream(tcp, server.tls.as_ref(), server.handshake_timeout).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("Control connection from {} failed: {}", remote, e);
                        return;
                    }
                };
                server
                    .handle_connection(stream, remote.to_string(), cancel)
                    .await;
            });
        }

        info!("Backend control server stopping, closing {} sessions", self.manager.len());
        self.manager.close_all();
        Ok(())
    }

    /// Serve one client connection; the first message selects the call
    pub async fn handle_connection(
        &self,
        stream: BoxedStream,
        remote_addr: String,
        cancel: CancellationToken,
    ) {
        let mut conn = framed::<TunnelMessage>(stream);

        let first = match tokio::time::timeout(self.handshake_timeout, conn.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("Bad first frame from {}: {}", remote_addr, e);
                return;
            }
            Ok(None) => {
                debug!("{} closed before the first message", remote_addr);
                return;
            }
            Err(_) => {
                debug!("{} sent nothing within {:?}", remote_addr, self.handshake_timeout);
                return;
            }
        };

        match first {
            TunnelMessage::Login {
                access_key_id,
                secret,
            } => self.handle_login(conn, &access_key_id, &secret).await,
            TunnelMessage::Connect { credentials } => {
                self.handle_connect(conn, credentials, &remote_addr).await
            }
            TunnelMessage::WatchTunnels { domain_filter } => {
                self.handle_watch(conn, domain_filter, cancel).await
            }
            other => {
                warn!("Unexpected first message from {}: {:?}", remote_addr, other);
                let _ = conn
                    .send(TunnelMessage::rejected(
                        RejectReason::ProtocolError,
                        "expected Login, Connect or WatchTunnels",
                    ))
                    .await;
            }
        }
    }

    async fn handle_login(
        &self,
        mut conn: MessageStream<TunnelMessage>,
        access_key_id: &str,
        secret: &str,
    ) {
        let reply = match self.manager.authenticator().login(access_key_id, secret).await {
            Ok((token, expires_at)) => {
                info!(access_key_id = %access_key_id, "Login succeeded");
                TunnelMessage::LoginOk { token, expires_at }
            }
            Err(e) => reject_for(&e),
        };
        if let Err(e) = conn.send(reply).await {
            debug!("Failed to send login reply: {}", e);
        }
    }

    async fn handle_connect(
        &self,
        mut conn: MessageStream<TunnelMessage>,
        credentials: Credentials,
        remote_addr: &str,
    ) {
        let access_key_id = match self.manager.authenticator().authenticate(&credentials).await {
            Ok(id) => id,
            Err(e) => {
                info!("Rejected tunnel connection from {}: {}", remote_addr, e);
                let _ = conn.send(reject_for(&e)).await;
                return;
            }
        };

        let (session, outbound_rx) = self.manager.create_session(&access_key_id, remote_addr);
        let config = session.config();
        let connected = TunnelMessage::Connected {
            session_id: session.id().to_string(),
            heartbeat_interval_secs: config.heartbeat_interval.as_secs(),
            ttl_secs: config.record_ttl.as_secs(),
        };

        if let Err(e) = conn.send(connected).await {
            warn!(session_id = %session.id(), "Failed to confirm session: {}", e);
            session.close();
        }

        let session_id = session.id().to_string();
        session.run(conn, outbound_rx).await;
        self.manager.remove(&session_id);
    }

    async fn handle_watch(
        &self,
        mut conn: MessageStream<TunnelMessage>,
        domain_filter: Option<String>,
        cancel: CancellationToken,
    ) {
        let filter = domain_filter.map(|d| kun_router::normalize_domain(&d));
        let matches = |event: &TunnelEvent| match &filter {
            None => true,
            Some(domain) => event.domain() == Some(domain.as_str()),
        };

        // Subscribe before taking the snapshot so nothing falls in between
        let mut events = self.manager.subscribe();

        let mut snapshot = Vec::new();
        for session in self.manager.sessions() {
            snapshot.push(TunnelEvent::new(
                session.id(),
                session.access_key_id(),
                TunnelEventKind::Connected,
            ));
            for domain in session.owned_domains() {
                snapshot.push(TunnelEvent::new(
                    session.id(),
                    session.access_key_id(),
                    TunnelEventKind::DomainRegistered(domain),
                ));
            }
        }
        for event in snapshot.into_iter().filter(|e| matches(e)) {
            if conn.send(TunnelMessage::TunnelEvent(event)).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = conn.next() => match incoming {
                    Some(Ok(TunnelMessage::Close { .. })) | Some(Err(_)) | None => break,
                    Some(Ok(other)) => debug!("Ignoring {:?} on watch stream", other),
                },
                event = events.recv() => match event {
                    Ok(event) if matches(&event) => {
                        if conn.send(TunnelMessage::TunnelEvent(event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Watch stream lagged by {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Watch stream ended");
    }
}

fn reject_for(error: &AuthError) -> TunnelMessage {
    match error {
        AuthError::AuthFailed => TunnelMessage::rejected(RejectReason::AuthFailed, error.to_string()),
        other => {
            error!("Auth plugin failure: {}", other);
            TunnelMessage::rejected(RejectReason::Internal, "authentication unavailable")
        }
    }
}
