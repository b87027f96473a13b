//! Tunnel session, client side

use crate::config::ClientConfig;
use crate::ClientError;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use kun_connection::{framed, relay, Backoff, ChannelMux, DataChannel, Dialer, MessageStream};
use kun_proto::TunnelMessage;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const OUTBOUND_CAPACITY: usize = 1024;

/// Opens a tunnel session and registers the configured domains
pub struct TunnelConnector {
    config: ClientConfig,
    dialer: Dialer,
}

impl TunnelConnector {
    pub fn new(config: ClientConfig, dialer: Dialer) -> Self {
        Self { config, dialer }
    }

    pub async fn connect(&self) -> Result<TunnelConnection, ClientError> {
        let handshake = self.handshake();
        tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| ClientError::HandshakeTimeout)?
    }

    async fn handshake(&self) -> Result<TunnelConnection, ClientError> {
        info!("Connecting to {}", self.config.server);
        let stream = self.dialer.dial(&self.config.server).await?;
        let mut conn = framed::<TunnelMessage>(stream);

        conn.send(TunnelMessage::Connect {
            credentials: self.config.credentials.clone(),
        })
        .await?;

        let (session_id, server_interval) = match next_message(&mut conn).await? {
            TunnelMessage::Connected {
                session_id,
                heartbeat_interval_secs,
                ..
            } => (session_id, Duration::from_secs(heartbeat_interval_secs.max(1))),
            TunnelMessage::Rejected { reason, message } => {
                return Err(ClientError::Rejected { reason, message })
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected Connected, got {:?}",
                    other
                )))
            }
        };
        info!(session_id = %session_id, "Tunnel session established");

        let mut registered = Vec::new();
        let mut rejected = Vec::new();
        for domain in &self.config.domains {
            conn.send(TunnelMessage::RegisterDomain {
                domain: domain.clone(),
            })
            .await?;

            match next_message(&mut conn).await? {
                TunnelMessage::DomainRegistered { domain, expired_at } => {
                    info!(domain = %domain, "Domain registered");
                    registered.push((domain, expired_at));
                }
                TunnelMessage::DomainRejected {
                    domain,
                    reason,
                    message,
                } => {
                    warn!(domain = %domain, "Domain rejected ({}): {}", reason, message);
                    rejected.push((domain, reason));
                }
                other => {
                    return Err(ClientError::Protocol(format!(
                        "expected a registration reply, got {:?}",
                        other
                    )))
                }
            }
        }

        if registered.is_empty() {
            let _ = conn
                .send(TunnelMessage::Close {
                    reason: "no domain registered".to_string(),
                })
                .await;
            return Err(ClientError::NoDomainRegistered(rejected));
        }

        Ok(TunnelConnection {
            conn,
            session_id,
            heartbeat_interval: self.config.heartbeat_interval.unwrap_or(server_interval),
            registered,
            config: self.config.clone(),
        })
    }
}

/// Nothing but control replies arrive before the session is running
async fn next_message(conn: &mut MessageStream<TunnelMessage>) -> Result<TunnelMessage, ClientError> {
    match conn.next().await {
        Some(msg) => Ok(msg?),
        None => Err(ClientError::ConnectionClosed),
    }
}

/// An established session with at least one registered domain
pub struct TunnelConnection {
    conn: MessageStream<TunnelMessage>,
    session_id: String,
    heartbeat_interval: Duration,
    registered: Vec<(String, DateTime<Utc>)>,
    config: ClientConfig,
}

impl TunnelConnection {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Registered domains with their first expiry
    pub fn registered(&self) -> &[(String, DateTime<Utc>)] {
        &self.registered
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Heartbeat and serve data channels until the server closes the session
    /// or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ClientError> {
        let (mut sink, mut source) = self.conn.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<TunnelMessage>(OUTBOUND_CAPACITY);
        let mux = ChannelMux::new(outbound.clone(), self.config.channel_window);

        // The server stopped reading once a write blocks this long
        let stall = self.heartbeat_interval * 3;
        let writer_failed = CancellationToken::new();
        let failed = writer_failed.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let last = matches!(msg, TunnelMessage::Close { .. });
                match tokio::time::timeout(stall, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Session writer stopped: {}", e);
                        failed.cancel();
                        return;
                    }
                    Err(_) => {
                        warn!("Session writer blocked for {:?}", stall);
                        failed.cancel();
                        return;
                    }
                }
                if last {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut domains: Vec<String> = self.registered.into_iter().map(|(d, _)| d).collect();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = outbound.try_send(TunnelMessage::Close {
                        reason: "client shutting down".to_string(),
                    });
                    break Ok(());
                }
                _ = writer_failed.cancelled() => break Err(ClientError::ConnectionClosed),
                _ = heartbeat.tick() => {
                    let msg = TunnelMessage::Heartbeat { timestamp: unix_millis() };
                    if outbound.try_send(msg).is_err() {
                        warn!("Outbound queue full or closed, dropping session");
                        break Err(ClientError::ConnectionClosed);
                    }
                }
                incoming = source.next() => {
                    let msg = match incoming {
                        None => break Err(ClientError::ConnectionClosed),
                        Some(Err(e)) => break Err(e.into()),
                        Some(Ok(msg)) => msg,
                    };
                    match msg {
                        TunnelMessage::OpenChannel { stream_id, domain, remote_addr } => {
                            match mux.accept(stream_id) {
                                Ok(channel) => {
                                    debug!(stream_id, domain = %domain, remote_addr = %remote_addr, "Channel opened");
                                    tokio::spawn(serve_channel(
                                        channel,
                                        self.config.target.clone(),
                                        self.config.connect_timeout,
                                        self.config.idle_timeout,
                                    ));
                                }
                                Err(e) => warn!("Cannot accept channel {}: {}", stream_id, e),
                            }
                        }
                        TunnelMessage::Data { stream_id, data } => {
                            if let Err(e) = mux.on_data(stream_id, data) {
                                warn!("{}", e);
                            }
                        }
                        TunnelMessage::WindowUpdate { stream_id, credit } => {
                            mux.on_window_update(stream_id, credit)
                        }
                        TunnelMessage::CloseChannel { stream_id } => {
                            mux.on_close(stream_id);
                        }
                        TunnelMessage::HeartbeatAck { timestamp } => {
                            trace!("Heartbeat acknowledged ({})", timestamp)
                        }
                        TunnelMessage::DomainSuperseded { domain } => {
                            warn!(domain = %domain, "Domain taken over by a newer registration");
                            domains.retain(|d| d != &domain);
                            if domains.is_empty() {
                                info!("No domain left on this session");
                            }
                        }
                        TunnelMessage::Close { reason } => {
                            break Err(ClientError::ClosedByServer(reason));
                        }
                        TunnelMessage::Rejected { reason, message } => {
                            break Err(ClientError::Rejected { reason, message });
                        }
                        other => debug!("Ignoring {:?}", other),
                    }
                }
            }
        };

        mux.close_all();
        drop(outbound);
        if tokio::time::timeout(Duration::from_secs(5), &mut writer).await.is_err() {
            writer.abort();
        }
        info!(session_id = %self.session_id, "Tunnel session ended");
        result
    }
}

async fn serve_channel(
    mut channel: DataChannel,
    target: String,
    connect_timeout: Duration,
    idle_timeout: Duration,
) {
    let stream_id = channel.stream_id();
    let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            warn!("Cannot reach {} for channel {}: {}", target, stream_id, e);
            let _ = channel.write(&bad_gateway(&target)).await;
            channel.close().await;
            return;
        }
        Err(_) => {
            warn!("Timed out connecting to {} for channel {}", target, stream_id);
            channel.close().await;
            return;
        }
    };
    let _ = tcp.set_nodelay(true);

    let stats = relay(tcp, channel, idle_timeout).await;
    debug!(
        stream_id,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        "Channel finished ({:?})",
        stats.end
    );
}

fn bad_gateway(target: &str) -> Vec<u8> {
    let body = format!("local service {} is not reachable\n", target);
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Keep a session up, reconnecting with backoff, until `cancel` fires or the
/// server refuses the client for good.
pub async fn run_with_reconnect(
    config: ClientConfig,
    dialer: Dialer,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let mut backoff = Backoff::new(config.reconnect.clone());
    let connector = TunnelConnector::new(config, dialer);

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connector.connect() => result,
        };

        let error = match attempt {
            Ok(connection) => {
                backoff.reset();
                match connection.run(cancel.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }
        warn!("Tunnel session lost: {}", error);

        if backoff.wait(&cancel).await.is_err() {
            return if cancel.is_cancelled() { Ok(()) } else { Err(error) };
        }
    }
}
