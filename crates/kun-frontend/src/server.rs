//! Public listeners

use crate::response::error_response;
use crate::router::FrontendRouter;
use crate::FrontendError;
use kun_router::{extract_host, extract_sni, find_head_end, normalize_domain, record_len};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const READ_CHUNK: usize = 4096;
/// Largest TLS record a ClientHello can arrive in
const MAX_CLIENT_HELLO: usize = 5 + 16 * 1024;

/// What a public listener does with its connections
#[derive(Clone)]
pub enum ListenerMode {
    /// Plain HTTP routed by Host header
    Http,
    /// TLS terminated here, routed by SNI or Host header
    Https(TlsAcceptor),
    /// TLS forwarded untouched, routed by the ClientHello SNI
    Passthrough,
}

impl ListenerMode {
    fn name(&self) -> &'static str {
        match self {
            ListenerMode::Http => "http",
            ListenerMode::Https(_) => "https",
            ListenerMode::Passthrough => "tls-passthrough",
        }
    }
}

pub struct FrontendServer {
    router: Arc<FrontendRouter>,
}

impl FrontendServer {
    pub fn new(router: Arc<FrontendRouter>) -> Self {
        Self { router }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, FrontendError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| FrontendError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accept public connections until `cancel` fires.
    ///
    /// Connections already relaying are not interrupted.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mode: ListenerMode,
        cancel: CancellationToken,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!("Frontend {} listener on {}", mode.name(), addr);
        }

        loop {
            let (tcp, remote) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Frontend accept error: {}", e);
                        continue;
                    }
                },
            };

            let server = self.clone();
            let mode = mode.clone();
            tokio::spawn(async move {
                let remote = remote.to_string();
                let result = match mode {
                    ListenerMode::Http => server.handle_http(tcp, &remote).await,
                    ListenerMode::Https(acceptor) => {
                        server.handle_https(tcp, &acceptor, &remote).await
                    }
                    ListenerMode::Passthrough => server.handle_passthrough(tcp, &remote).await,
                };
                if let Err(e) = result {
                    debug!("Public connection from {} ended: {}", remote, e);
                }
            });
        }

        info!("Frontend {} listener stopped", mode.name());
    }

    async fn handle_http(&self, mut tcp: TcpStream, remote: &str) -> Result<(), FrontendError> {
        let _ = tcp.set_nodelay(true);
        let head = self.read_head(&mut tcp).await;
        let routed = match head {
            Ok(head) => self.route_head(head, remote).await,
            Err(e) => Err(e),
        };
        self.finish(tcp, routed, remote).await
    }

    async fn handle_https(
        &self,
        tcp: TcpStream,
        acceptor: &TlsAcceptor,
        remote: &str,
    ) -> Result<(), FrontendError> {
        let _ = tcp.set_nodelay(true);
        let mut tls = tokio::time::timeout(self.router.config().read_timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| FrontendError::Timeout)?
            .map_err(|e| FrontendError::Tls(e.to_string()))?;

        let sni = tls.get_ref().1.server_name().map(normalize_domain);
        let routed = match sni {
            Some(domain) => match self.router.open(&domain, remote).await {
                Ok(upstream) => Ok((domain, Vec::new(), upstream)),
                Err(e) => Err(e),
            },
            None => match self.read_head(&mut tls).await {
                Ok(head) => self.route_head(head, remote).await,
                Err(e) => Err(e),
            },
        };
        self.finish(tls, routed, remote).await
    }

    async fn handle_passthrough(&self, mut tcp: TcpStream, remote: &str) -> Result<(), FrontendError> {
        let _ = tcp.set_nodelay(true);
        let hello = self.read_client_hello(&mut tcp).await?;
        let domain = extract_sni(&hello).map_err(|e| FrontendError::BadRequest(e.to_string()))?;

        // No HTTP error page can be sent inside someone else's TLS session
        let upstream = self.router.open(&domain, remote).await?;
        info!(domain = %domain, remote_addr = %remote, "Passing TLS connection through");
        let stats = self.router.forward(tcp, &hello, upstream).await?;
        debug!(domain = %domain, "Passthrough finished ({:?})", stats.end);
        Ok(())
    }

    async fn route_head(
        &self,
        head: Vec<u8>,
        remote: &str,
    ) -> Result<(String, Vec<u8>, crate::Upstream), FrontendError> {
        let end = find_head_end(&head).unwrap_or(head.len());
        let domain =
            extract_host(&head[..end]).map_err(|e| FrontendError::BadRequest(e.to_string()))?;
        let upstream = self.router.open(&domain, remote).await?;
        Ok((domain, head, upstream))
    }

    /// Relay a routed connection, or answer with an error page
    async fn finish<S>(
        &self,
        mut client: S,
        routed: Result<(String, Vec<u8>, crate::Upstream), FrontendError>,
        remote: &str,
    ) -> Result<(), FrontendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (domain, initial, upstream) = match routed {
            Ok(routed) => routed,
            Err(e) => {
                if let Some(page) = error_response(&e) {
                    let _ = client.write_all(&page).await;
                    let _ = client.shutdown().await;
                }
                return Err(e);
            }
        };

        info!(domain = %domain, remote_addr = %remote, "Routing public connection");
        let stats = self.router.forward(client, &initial, upstream).await?;
        debug!(
            domain = %domain,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Public connection finished ({:?})",
            stats.end
        );
        Ok(())
    }

    /// Read until the request head is complete
    async fn read_head<S>(&self, stream: &mut S) -> Result<Vec<u8>, FrontendError>
    where
        S: AsyncRead + Unpin,
    {
        let max = self.router.config().max_head_size;
        let mut buf = Vec::with_capacity(READ_CHUNK);
        read_until(stream, &mut buf, self.router.config().read_timeout, |buf| {
            if find_head_end(buf).is_some() {
                Ok(true)
            } else if buf.len() >= max {
                Err(FrontendError::BadRequest("request head too large".to_string()))
            } else {
                Ok(false)
            }
        })
        .await?;
        Ok(buf)
    }

    /// Read the first TLS record, which carries the ClientHello
    async fn read_client_hello<S>(&self, stream: &mut S) -> Result<Vec<u8>, FrontendError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        read_until(stream, &mut buf, self.router.config().read_timeout, |buf| {
            match record_len(buf).map_err(|e| FrontendError::BadRequest(e.to_string()))? {
                Some(len) if len > MAX_CLIENT_HELLO => {
                    Err(FrontendError::BadRequest("oversized TLS record".to_string()))
                }
                Some(len) => Ok(buf.len() >= len),
                None => Ok(false),
            }
        })
        .await?;
        Ok(buf)
    }
}

async fn read_until<S, F>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    timeout: Duration,
    mut complete: F,
) -> Result<(), FrontendError>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<bool, FrontendError>,
{
    let read = async {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if complete(buf.as_slice())? {
                return Ok::<(), FrontendError>(());
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrontendError::ClientClosed);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| FrontendError::Timeout)?
}
