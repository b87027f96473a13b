//! Byte-stream transports: plain TCP or TLS, framed with the protocol codec

use kun_proto::{CodecError, FrameCodec};
use rustls::pki_types::ServerName;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Any bidirectional byte stream the transports hand out
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A stream carrying length-prefixed protocol messages
pub type MessageStream<T> = Framed<BoxedStream, FrameCodec<T>>;

/// Wrap a byte stream with the protocol codec
pub fn framed<T>(stream: BoxedStream) -> MessageStream<T> {
    Framed::new(stream, FrameCodec::new())
}

/// Turn a configured address or member URL into something `TcpStream::connect` accepts.
///
/// Accepts `host:port`, `:port` and `scheme://host:port[/path]`.
pub fn dial_address(url: &str) -> Result<String, TransportError> {
    let without_scheme = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .trim();

    if authority.is_empty() {
        return Err(TransportError::InvalidAddress(url.to_string()));
    }

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(format!("{} (missing port)", url)))?;

    if port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidAddress(format!(
            "{} (invalid port)",
            url
        )));
    }

    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok(format!("{}:{}", host, port))
}

/// Turn a configured bind address (`:8080` style allowed) into a listen address
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Host part of a `host:port` address, used as TLS server name
pub fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Opens outbound connections, optionally wrapped in TLS
#[derive(Clone)]
pub struct Dialer {
    tls: Option<TlsConnector>,
    server_name: Option<String>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn plain() -> Self {
        Self {
            tls: None,
            server_name: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn tls(connector: TlsConnector) -> Self {
        Self {
            tls: Some(connector),
            ..Self::plain()
        }
    }

    /// Override the TLS server name (defaults to the dialed host)
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to `url` (see [`dial_address`] for accepted forms)
    pub async fn dial(&self, url: &str) -> Result<BoxedStream, TransportError> {
        let addr = dial_address(url)?;
        trace!("Dialing {}", addr);

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        tcp.set_nodelay(true)?;

        let Some(connector) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(&addr).to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name {}: {}", name, e)))?;

        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::TlsError(format!("Handshake with {} failed: {}", addr, e)))?;

        debug!("TLS connection established to {}", addr);
        Ok(Box::new(tls))
    }
}

/// Finish accepting an inbound connection, running the TLS handshake when configured
pub async fn accept_stream(
    tcp: TcpStream,
    tls: Option<&TlsAcceptor>,
    handshake_timeout: Duration,
) -> Result<BoxedStream, TransportError> {
    tcp.set_nodelay(true)?;

    let Some(acceptor) = tls else {
        return Ok(Box::new(tcp));
    };

    let stream = tokio::time::timeout(handshake_timeout, acceptor.accept(tcp))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::TlsError(format!("Handshake failed: {}", e)))?;

    Ok(Box::new(stream))
}
