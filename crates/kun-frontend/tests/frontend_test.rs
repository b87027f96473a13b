//! Public HTTP(S) routing over real TCP, local and through a second node

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use kun_auth::{AllowAllPlugin, Authenticator, TokenIssuer};
use kun_connection::{framed, ClientTlsConfig, Dialer, MessageStream, ServerTlsConfig};
use kun_control::{NodeInfo, SessionConfig, SessionManager};
use kun_frontend::{FrontendConfig, FrontendRouter, FrontendServer, ListenerMode};
use kun_peer::PeerServer;
use kun_proto::{Endpoint, TunnelMessage, UpstreamRecord};
use kun_router::{extract_sni, find_head_end, UpstreamRegistry};
use rustls::pki_types::ServerName;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

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
    frontend: Arc<FrontendServer>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TestNode {
    async fn start(node_id: &str) -> Self {
        init_tracing();
        let cancel = CancellationToken::new();

        let peer_listener = PeerServer::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_listener.local_addr().unwrap().to_string();
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
        tokio::spawn(Arc::new(PeerServer::new(manager.clone())).serve(peer_listener, cancel.clone()));

        let router = Arc::new(FrontendRouter::new(
            manager.clone(),
            Dialer::plain(),
            FrontendConfig::default(),
        ));
        let frontend = Arc::new(FrontendServer::new(router));
        let http = FrontendServer::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http.local_addr().unwrap();
        tokio::spawn(frontend.clone().serve(http, ListenerMode::Http, cancel.clone()));

        Self {
            peer_addr,
            registry,
            manager,
            frontend,
            http_addr,
            cancel,
        }
    }

    async fn listen(&self, mode: ListenerMode) -> SocketAddr {
        let listener = FrontendServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(self.frontend.clone().serve(listener, mode, self.cancel.clone()));
        addr
    }
}

/// The client end of a tunnel session on a node
struct Tunnel {
    conn: MessageStream<TunnelMessage>,
    session_id: String,
}

impl Tunnel {
    async fn attach(manager: &Arc<SessionManager>, domain: &str) -> Self {
        let (session, outbound_rx) = manager.create_session("alice", "198.51.100.7:40000");
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        tokio::spawn(session.clone().run(framed(Box::new(server_io)), outbound_rx));

        let mut tunnel = Self {
            conn: framed(Box::new(client_io)),
            session_id: session.id().to_string(),
        };
        tunnel
            .conn
            .send(TunnelMessage::RegisterDomain {
                domain: domain.to_string(),
            })
            .await
            .unwrap();
        match tunnel.next().await {
            TunnelMessage::DomainRegistered { .. } => tunnel,
            other => panic!("expected DomainRegistered, got {:?}", other),
        }
    }

    async fn next(&mut self) -> TunnelMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.conn.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed")
                .expect("decode failed");
            if !matches!(msg, TunnelMessage::WindowUpdate { .. }) {
                return msg;
            }
        }
    }

    /// Accept one channel, collect bytes until `done` says so, answer and close
    async fn serve_one(&mut self, done: impl Fn(&[u8]) -> bool, response: &[u8]) -> Vec<u8> {
        let stream_id = match self.next().await {
            TunnelMessage::OpenChannel { stream_id, .. } => stream_id,
            other => panic!("expected OpenChannel, got {:?}", other),
        };

        let mut received = Vec::new();
        while !done(&received) {
            match self.next().await {
                TunnelMessage::Data { stream_id: id, data } if id == stream_id => {
                    received.extend_from_slice(&data)
                }
                other => panic!("expected Data, got {:?}", other),
            }
        }

        self.conn
            .send(TunnelMessage::Data {
                stream_id,
                data: response.to_vec(),
            })
            .await
            .unwrap();
        self.conn
            .send(TunnelMessage::CloseChannel { stream_id })
            .await
            .unwrap();
        received
    }
}

fn head_complete(buf: &[u8]) -> bool {
    find_head_end(buf).is_some()
}

async fn exchange<S>(mut stream: S, request: &[u8]) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading the response")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn http_get(addr: SocketAddr, host: &str) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /hello HTTP/1.1\r\nHost: {}\r\nUser-Agent: test\r\n\r\n", host);
    exchange(tcp, request.as_bytes()).await
}

fn write_cert(dir: &std::path::Path, domain: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
    let cert_path = dir.join("tls.crt");
    let key_path = dir.join("tls.key");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(cert.cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(cert.key_pair.serialize_pem().as_bytes())
        .unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn test_unknown_domain_is_bad_gateway() {
    let node = TestNode::start("node-a").await;
    let response = http_get(node.http_addr, "nobody.example.com").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
    assert!(response.contains("nobody.example.com"));
}

#[tokio::test]
async fn test_missing_host_is_400() {
    let node = TestNode::start("node-a").await;
    let tcp = TcpStream::connect(node.http_addr).await.unwrap();
    let response = exchange(tcp, b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
}

#[tokio::test]
async fn test_local_route() {
    let node = TestNode::start("node-a").await;
    let mut tunnel = Tunnel::attach(&node.manager, "a.example.com").await;

    let public = tokio::spawn(http_get(node.http_addr, "A.Example.com:8080"));
    let request = tunnel.serve_one(head_complete, RESPONSE).await;
    let request = String::from_utf8(request).unwrap();
    assert!(request.starts_with("GET /hello HTTP/1.1\r\n"));
    assert!(request.contains("Host: A.Example.com:8080\r\n"));

    assert_eq!(public.await.unwrap().as_bytes(), RESPONSE);
}

#[tokio::test]
async fn test_stale_session_is_bad_gateway() {
    let node = TestNode::start("node-a").await;
    node.registry.upsert(UpstreamRecord::new(
        "gone.example.com",
        Endpoint::new("node-a", node.peer_addr.clone(), "session-gone"),
        Utc::now(),
        ChronoDuration::seconds(60),
    ));

    let response = http_get(node.http_addr, "gone.example.com").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
}

#[tokio::test]
async fn test_expired_record_is_bad_gateway() {
    let node = TestNode::start("node-a").await;
    let tunnel = Tunnel::attach(&node.manager, "a.example.com").await;

    // Registered 90s ago with a 60s TTL and never refreshed
    node.registry.remove("a.example.com", &tunnel.session_id);
    node.registry.upsert(UpstreamRecord::new(
        "a.example.com",
        Endpoint::new("node-a", node.peer_addr.clone(), tunnel.session_id.clone()),
        Utc::now() - ChronoDuration::seconds(90),
        ChronoDuration::seconds(60),
    ));

    let response = http_get(node.http_addr, "a.example.com").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
}

#[tokio::test]
async fn test_remote_route_through_owning_node() {
    let node_a = TestNode::start("node-a").await;
    let node_b = TestNode::start("node-b").await;
    let mut tunnel = Tunnel::attach(&node_a.manager, "a.example.com").await;

    // What replication would have delivered to B
    let record = node_a.registry.get("a.example.com").unwrap();
    assert_eq!(record.endpoint.peer_addr, node_a.peer_addr);
    node_b.registry.upsert(record);

    let public = tokio::spawn(http_get(node_b.http_addr, "a.example.com"));
    let request = tunnel.serve_one(head_complete, RESPONSE).await;
    assert!(request.starts_with(b"GET /hello HTTP/1.1\r\n"));

    assert_eq!(public.await.unwrap().as_bytes(), RESPONSE);
}

#[tokio::test]
async fn test_unreachable_owner_is_502() {
    let node = TestNode::start("node-a").await;

    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = placeholder.local_addr().unwrap().to_string();
    drop(placeholder);

    node.registry.upsert(UpstreamRecord::new(
        "far.example.com",
        Endpoint::new("node-z", dead_addr, "session-z"),
        Utc::now(),
        ChronoDuration::seconds(60),
    ));

    let response = http_get(node.http_addr, "far.example.com").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
}

#[tokio::test]
async fn test_https_terminated_and_routed_by_sni() {
    let node = TestNode::start("node-a").await;
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_cert(dir.path(), "a.example.com");
    let acceptor = ServerTlsConfig::new(&cert, &key).acceptor().unwrap();
    let https_addr = node.listen(ListenerMode::Https(acceptor)).await;
    let mut tunnel = Tunnel::attach(&node.manager, "a.example.com").await;

    let public = tokio::spawn(async move {
        let connector = ClientTlsConfig {
            root_ca_files: vec![cert],
            ..Default::default()
        }
        .connector()
        .unwrap();
        let tcp = TcpStream::connect(https_addr).await.unwrap();
        let name = ServerName::try_from("a.example.com".to_string()).unwrap();
        let tls = connector.connect(name, tcp).await.unwrap();
        exchange(tls, b"GET /secure HTTP/1.1\r\nHost: a.example.com\r\n\r\n").await
    });

    // The tunnel sees plaintext
    let request = tunnel.serve_one(head_complete, RESPONSE).await;
    assert!(request.starts_with(b"GET /secure HTTP/1.1\r\n"));

    assert_eq!(public.await.unwrap().as_bytes(), RESPONSE);
}

#[tokio::test]
async fn test_tls_passthrough_forwards_client_hello() {
    let node = TestNode::start("node-a").await;
    let passthrough_addr = node.listen(ListenerMode::Passthrough).await;
    let mut tunnel = Tunnel::attach(&node.manager, "a.example.com").await;

    let client = tokio::spawn(async move {
        let connector = ClientTlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        }
        .connector()
        .unwrap();
        let tcp = TcpStream::connect(passthrough_addr).await.unwrap();
        let name = ServerName::try_from("a.example.com".to_string()).unwrap();
        // The tunnel answers with garbage, so the handshake fails
        let _ = connector.connect(name, tcp).await;
    });

    let hello = tunnel
        .serve_one(|buf| buf.len() >= 5, b"not a server hello")
        .await;
    assert_eq!(hello[0], 0x16);
    let record_end = 5 + u16::from_be_bytes([hello[3], hello[4]]) as usize;
    let hello = if hello.len() >= record_end {
        hello[..record_end].to_vec()
    } else {
        hello
    };
    assert_eq!(extract_sni(&hello).unwrap(), "a.example.com");

    tokio::time::timeout(Duration::from_secs(5), client)
        .await
        .unwrap()
        .unwrap();
}
