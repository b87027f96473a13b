//! Two-node replication and channel forwarding over real TCP

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use kun_auth::{AllowAllPlugin, Authenticator, TokenIssuer};
use kun_connection::{framed, BackoffConfig, Dialer, MessageStream};
use kun_control::{NodeInfo, SessionConfig, SessionManager};
use kun_peer::{dial_channel, watch_upstream, LinkStatus, PeerError, PeerReplicator, PeerServer};
use kun_proto::{Endpoint, RejectReason, TunnelMessage, UpstreamRecord};
use kun_router::UpstreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct TestNode {
    peer_addr: String,
    registry: Arc<UpstreamRegistry>,
    manager: Arc<SessionManager>,
}

async fn start_node(node_id: &str, cancel: &CancellationToken) -> TestNode {
    init_tracing();
    let listener = PeerServer::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap().to_string();

    let registry = Arc::new(UpstreamRegistry::new());
    let manager = Arc::new(SessionManager::new(
        NodeInfo::new(node_id, peer_addr.clone()),
        SessionConfig::default(),
        registry.clone(),
        Authenticator::new(
            Arc::new(AllowAllPlugin),
            TokenIssuer::ephemeral(ChronoDuration::hours(1)),
        ),
    ));

    let server = Arc::new(PeerServer::new(manager.clone()));
    tokio::spawn(server.serve(listener, cancel.clone()));

    TestNode {
        peer_addr,
        registry,
        manager,
    }
}

fn replicator(node_id: &str, members: Vec<String>, registry: Arc<UpstreamRegistry>) -> Arc<PeerReplicator> {
    Arc::new(
        PeerReplicator::new(node_id, members, registry, Dialer::plain()).with_backoff(
            BackoffConfig {
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(200),
                ..Default::default()
            },
        ),
    )
}

fn record(domain: &str, node: &str, session: &str, offset_secs: i64) -> UpstreamRecord {
    UpstreamRecord::new(
        domain,
        Endpoint::new(node, "127.0.0.1:7070", session),
        Utc::now() + ChronoDuration::seconds(offset_secs),
        ChronoDuration::seconds(60),
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Next message, skipping flow-control credit
async fn next(conn: &mut MessageStream<TunnelMessage>) -> TunnelMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("decode failed");
        if !matches!(msg, TunnelMessage::WindowUpdate { .. }) {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_two_nodes_converge() {
    let cancel = CancellationToken::new();
    let a = start_node("node-a", &cancel).await;
    let b = start_node("node-b", &cancel).await;

    // Present before the link exists: travels in the snapshot
    let early = record("early.example.com", "node-b", "sb1", 0);
    b.registry.upsert(early.clone());

    let repl_a = replicator(
        "node-a",
        vec![b.peer_addr.clone(), a.peer_addr.clone()],
        a.registry.clone(),
    );
    let repl_b = replicator("node-b", vec![a.peer_addr.clone()], b.registry.clone());
    tokio::spawn(repl_a.clone().run(cancel.clone()));
    tokio::spawn(repl_b.clone().run(cancel.clone()));

    {
        let registry = a.registry.clone();
        wait_until(move || registry.get("early.example.com").is_some()).await;
    }
    assert_eq!(a.registry.get("early.example.com"), Some(early));

    // Live upsert on A reaches B
    let live = record("live.example.com", "node-a", "sa1", 0);
    a.registry.upsert(live.clone());
    {
        let registry = b.registry.clone();
        wait_until(move || registry.get("live.example.com").is_some()).await;
    }

    // A newer registration on B wins on both nodes
    let newer = record("live.example.com", "node-b", "sb2", 5);
    b.registry.upsert(newer.clone());
    {
        let (registry, newer) = (a.registry.clone(), newer.clone());
        wait_until(move || registry.get("live.example.com") == Some(newer.clone())).await;
    }

    // A stale removal from the old owner changes nothing
    a.registry.remove("live.example.com", "sa1");
    b.registry.remove("live.example.com", "sb2");
    {
        let (ra, rb) = (a.registry.clone(), b.registry.clone());
        wait_until(move || {
            ra.get("live.example.com").is_none() && rb.get("live.example.com").is_none()
        })
        .await;
    }

    // The self entry is dropped, the real member stays linked
    {
        let (repl, self_addr) = (repl_a.clone(), a.peer_addr.clone());
        wait_until(move || repl.link(&self_addr).is_none()).await;
    }
    let link = repl_a.link(&b.peer_addr).unwrap();
    assert!(link.is_connected());
    assert!(link.snapshot_received());
    assert_eq!(link.remote_node().as_deref(), Some("node-b"));

    cancel.cancel();
}

#[tokio::test]
async fn test_reconnect_resends_snapshot() {
    let cancel = CancellationToken::new();
    let a = start_node("node-a", &cancel).await;

    // Nothing listens yet on B's future address
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b_addr = placeholder.local_addr().unwrap().to_string();
    drop(placeholder);

    let repl_a = replicator("node-a", vec![b_addr.clone()], a.registry.clone());
    tokio::spawn(repl_a.clone().run(cancel.clone()));
    a.registry.upsert(record("a.example.com", "node-a", "sa1", 0));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!repl_a.link(&b_addr).unwrap().is_connected());

    // B comes up on that address
    let listener = tokio::net::TcpListener::bind(&b_addr).await.unwrap();
    let registry_b = Arc::new(UpstreamRegistry::new());
    let manager_b = Arc::new(SessionManager::new(
        NodeInfo::new("node-b", b_addr.clone()),
        SessionConfig::default(),
        registry_b.clone(),
        Authenticator::new(
            Arc::new(AllowAllPlugin),
            TokenIssuer::ephemeral(ChronoDuration::hours(1)),
        ),
    ));
    tokio::spawn(Arc::new(PeerServer::new(manager_b)).serve(listener, cancel.clone()));

    {
        let registry = registry_b.clone();
        wait_until(move || registry.get("a.example.com").is_some()).await;
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_watch_upstream_is_one_way() {
    let cancel = CancellationToken::new();
    let a = start_node("node-a", &cancel).await;
    a.registry.upsert(record("a.example.com", "node-a", "sa1", 0));

    let observer = Arc::new(UpstreamRegistry::new());
    observer.upsert(record("mine.example.com", "observer", "so1", 0));
    let status = Arc::new(LinkStatus::default());

    let watch = {
        let (observer, status, cancel, url) =
            (observer.clone(), status.clone(), cancel.clone(), a.peer_addr.clone());
        tokio::spawn(async move {
            watch_upstream(&Dialer::plain(), &url, "observer", &observer, &status, &cancel).await
        })
    };

    {
        let status = status.clone();
        wait_until(move || status.snapshot_received()).await;
    }
    assert!(observer.get("a.example.com").is_some());
    assert_eq!(status.remote_node().as_deref(), Some("node-a"));

    a.registry.upsert(record("b.example.com", "node-a", "sa2", 0));
    {
        let observer = observer.clone();
        wait_until(move || observer.get("b.example.com").is_some()).await;
    }
    assert!(a.registry.get("mine.example.com").is_none());

    cancel.cancel();
    assert!(watch.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_forwarded_channel_round_trip() {
    let cancel = CancellationToken::new();
    let a = start_node("node-a", &cancel).await;

    // A tunnel client attached to node A over an in-memory pipe
    let (session, outbound_rx) = a.manager.create_session("alice", "198.51.100.7:40000");
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(session.clone().run(framed(Box::new(server_io)), outbound_rx));
    let mut client = framed::<TunnelMessage>(Box::new(client_io));

    client
        .send(TunnelMessage::RegisterDomain {
            domain: "a.example.com".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(
        next(&mut client).await,
        TunnelMessage::DomainRegistered { .. }
    ));

    // Another node forwards a public connection through A's peer listener
    let mut remote = dial_channel(
        &Dialer::plain(),
        &a.peer_addr,
        session.id(),
        "a.example.com",
        "203.0.113.5:5000",
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(remote.leftover.is_empty());
    remote.stream.write_all(b"ping").await.unwrap();

    let stream_id = match next(&mut client).await {
        TunnelMessage::OpenChannel {
            stream_id,
            domain,
            remote_addr,
        } => {
            assert_eq!(domain, "a.example.com");
            assert_eq!(remote_addr, "203.0.113.5:5000");
            stream_id
        }
        other => panic!("expected OpenChannel, got {:?}", other),
    };
    match next(&mut client).await {
        TunnelMessage::Data { stream_id: id, data } => {
            assert_eq!(id, stream_id);
            assert_eq!(data, b"ping");
        }
        other => panic!("expected Data, got {:?}", other),
    }

    client
        .send(TunnelMessage::Data {
            stream_id,
            data: b"pong".to_vec(),
        })
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), remote.stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    cancel.cancel();
}

#[tokio::test]
async fn test_forwarded_channel_to_unknown_session() {
    let cancel = CancellationToken::new();
    let a = start_node("node-a", &cancel).await;

    let result = dial_channel(
        &Dialer::plain(),
        &a.peer_addr,
        "session-missing",
        "a.example.com",
        "203.0.113.5:5000",
        Duration::from_secs(5),
    )
    .await;

    match result {
        Err(PeerError::ChannelRejected(reason)) => {
            assert_eq!(reason, RejectReason::SessionNotActive)
        }
        Err(other) => panic!("expected ChannelRejected, got {}", other),
        Ok(_) => panic!("expected ChannelRejected, got a channel"),
    }
    cancel.cancel();
}
