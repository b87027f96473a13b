//! The replication exchange run over one peer connection

use crate::PeerError;
use futures::{SinkExt, StreamExt};
use kun_connection::MessageStream;
use kun_proto::{PeerMessage, UpstreamEvent, UpstreamRecord};
use kun_router::{RegistryEvent, UpstreamRegistry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames a link may have queued before the peer counts as stalled
pub const LINK_QUEUE_CAPACITY: usize = 1024;

/// Which directions of the exchange a link carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// `ConnectUpstream`: both sides send and apply
    Duplex,
    /// Serving `WatchUpstream`: send only
    SendOnly,
    /// Consuming `WatchUpstream`: apply only
    ReceiveOnly,
}

impl LinkMode {
    fn sends(self) -> bool {
        matches!(self, LinkMode::Duplex | LinkMode::SendOnly)
    }

    fn receives(self) -> bool {
        matches!(self, LinkMode::Duplex | LinkMode::ReceiveOnly)
    }
}

/// Observable progress of one link
#[derive(Debug, Default)]
pub struct LinkStatus {
    remote_node: Mutex<Option<String>>,
    connected: AtomicBool,
    snapshot_received: AtomicBool,
    last_applied_version: AtomicU64,
    last_acked_version: AtomicU64,
}

impl LinkStatus {
    pub fn remote_node(&self) -> Option<String> {
        match self.remote_node.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_remote_node(&self, node_id: &str) {
        let mut guard = match self.remote_node.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(node_id.to_string());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if !connected {
            self.snapshot_received.store(false, Ordering::Release);
        }
    }

    /// Whether the remote snapshot has been applied on the current connection
    pub fn snapshot_received(&self) -> bool {
        self.snapshot_received.load(Ordering::Acquire)
    }

    /// Remote version of the last event applied locally
    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version.load(Ordering::Acquire)
    }

    /// Highest local version the remote acknowledged
    pub fn last_acked_version(&self) -> u64 {
        self.last_acked_version.load(Ordering::Acquire)
    }
}

/// Apply a replicated change; returns whether the registry changed
pub fn apply_event(registry: &UpstreamRegistry, event: UpstreamEvent) -> bool {
    match event {
        UpstreamEvent::Upsert(record) => registry.upsert(record).is_applied(),
        UpstreamEvent::Remove { domain, session_id } => {
            registry.remove(&domain, &session_id).is_some()
        }
    }
}

/// Work for the link writer. A snapshot takes one queue slot and is expanded
/// into frames by the writer.
enum Outgoing {
    Frame(PeerMessage),
    Snapshot {
        version: u64,
        records: Vec<UpstreamRecord>,
    },
}

/// Queue without waiting; a full queue drops the link and the replicator
/// reconnects with a fresh snapshot.
fn enqueue(tx: &mpsc::Sender<Outgoing>, item: Outgoing) -> Result<(), PeerError> {
    tx.try_send(item).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => PeerError::SlowPeer,
        mpsc::error::TrySendError::Closed(_) => PeerError::ConnectionClosed,
    })
}

fn queue_snapshot(registry: &UpstreamRegistry, tx: &mpsc::Sender<Outgoing>) -> Result<(), PeerError> {
    // Changes racing with the snapshot also arrive as live events; applying
    // a record twice is a no-op.
    let version = registry.current_version();
    let records = registry.snapshot();
    debug!("Sending snapshot of {} records at v{}", records.len(), version);
    enqueue(tx, Outgoing::Snapshot { version, records })
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<RegistryEvent>>,
) -> Result<RegistryEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run the exchange until the connection closes or `cancel` fires.
///
/// Outgoing frames go through a dedicated writer task so that a peer busy
/// sending its own snapshot never blocks our reads.
pub async fn run_link(
    conn: MessageStream<PeerMessage>,
    registry: &UpstreamRegistry,
    status: &LinkStatus,
    mode: LinkMode,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    run_link_with_capacity(conn, registry, status, mode, cancel, LINK_QUEUE_CAPACITY).await
}

pub(crate) async fn run_link_with_capacity(
    conn: MessageStream<PeerMessage>,
    registry: &UpstreamRegistry,
    status: &LinkStatus,
    mode: LinkMode,
    cancel: &CancellationToken,
    capacity: usize,
) -> Result<(), PeerError> {
    let (sink, mut source) = conn.split();
    let (tx, rx) = mpsc::channel(capacity);
    let mut writer = tokio::spawn(write_loop(sink, rx));

    let mut events = mode.sends().then(|| registry.subscribe());
    if mode.sends() {
        queue_snapshot(registry, &tx)?;
    }

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = next_event(&mut events) => match event {
                Ok(event) => {
                    let msg = PeerMessage::Event {
                        version: event.version(),
                        event: event.to_upstream_event(),
                    };
                    if let Err(e) = enqueue(&tx, Outgoing::Frame(msg)) {
                        warn!("Dropping peer link: {}", e);
                        break Err(e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Peer link lagged by {} events, resending snapshot", skipped);
                    if let Err(e) = queue_snapshot(registry, &tx) {
                        break Err(e);
                    }
                }
                Err(RecvError::Closed) => break Ok(()),
            },
            incoming = source.next() => match incoming {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(msg)) => {
                    if let Err(e) = handle_incoming(msg, registry, status, mode, &tx) {
                        break Err(e);
                    }
                }
            },
        }
    };

    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    result
}

fn handle_incoming(
    msg: PeerMessage,
    registry: &UpstreamRegistry,
    status: &LinkStatus,
    mode: LinkMode,
    tx: &mpsc::Sender<Outgoing>,
) -> Result<(), PeerError> {
    match msg {
        PeerMessage::Event { version, event } if mode.receives() => {
            let domain = event.domain().to_string();
            if apply_event(registry, event) {
                trace!("Applied remote change v{} for {}", version, domain);
            }
            status
                .last_applied_version
                .store(version, Ordering::Release);
            enqueue(tx, Outgoing::Frame(PeerMessage::Ack { version }))
        }
        PeerMessage::SnapshotComplete { version } if mode.receives() => {
            debug!("Remote snapshot applied (v{})", version);
            status.snapshot_received.store(true, Ordering::Release);
            status
                .last_applied_version
                .store(version, Ordering::Release);
            enqueue(tx, Outgoing::Frame(PeerMessage::Ack { version }))
        }
        PeerMessage::Ack { version } if mode.sends() => {
            status
                .last_acked_version
                .fetch_max(version, Ordering::AcqRel);
            Ok(())
        }
        other => Err(PeerError::Protocol(format!(
            "unexpected message on {:?} link: {:?}",
            mode, other
        ))),
    }
}

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Outgoing>)
where
    S: futures::Sink<PeerMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(item) = rx.recv().await {
        let written = match item {
            Outgoing::Frame(msg) => sink.send(msg).await,
            Outgoing::Snapshot { version, records } => {
                write_snapshot(&mut sink, version, records).await
            }
        };
        if let Err(e) = written {
            debug!("Peer link writer stopped: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn write_snapshot<S>(
    sink: &mut S,
    version: u64,
    records: Vec<UpstreamRecord>,
) -> Result<(), S::Error>
where
    S: futures::Sink<PeerMessage> + Unpin,
{
    for record in records {
        sink.feed(PeerMessage::Event {
            version,
            event: UpstreamEvent::Upsert(record),
        })
        .await?;
    }
    sink.send(PeerMessage::SnapshotComplete { version }).await
}
