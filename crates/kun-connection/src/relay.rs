//! Copy bytes between a socket and a data channel

use crate::channel::{ChannelReader, ChannelWriter, DataChannel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The socket side reached EOF or failed
    SocketClosed,
    /// The channel was closed by the remote side or its session went away
    ChannelClosed,
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from the socket and sent into the channel
    pub bytes_in: u64,
    /// Bytes received from the channel and written to the socket
    pub bytes_out: u64,
    pub end: RelayEnd,
}

/// Relay until either side closes or nothing moves for `idle_timeout`.
///
/// The two directions run independently so a blocked write in one direction
/// never stops the other from draining. The channel is closed on return.
pub async fn relay<S>(stream: S, channel: DataChannel, idle_timeout: Duration) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream_id = channel.stream_id();
    let (mut channel_rx, mut channel_tx) = channel.into_split();
    let (mut socket_rx, mut socket_tx) = tokio::io::split(stream);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let touch = || {
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    };

    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let end = {
        let upstream = socket_to_channel(&mut socket_rx, &mut channel_tx, &mut bytes_in, &touch);
        let downstream = channel_to_socket(&mut channel_rx, &mut socket_tx, &mut bytes_out, &touch);
        let idle = async {
            loop {
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                let deadline = started + last + idle_timeout;
                if Instant::now() >= deadline {
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        };

        tokio::select! {
            end = upstream => end,
            end = downstream => end,
            _ = idle => RelayEnd::IdleTimeout,
        }
    };

    let _ = socket_tx.shutdown().await;
    channel_tx.close().await;

    debug!(
        "Relay on channel {} finished ({:?}): {} bytes in, {} bytes out",
        stream_id, end, bytes_in, bytes_out
    );

    RelayStats {
        bytes_in,
        bytes_out,
        end,
    }
}

/// Relay between two byte streams with the same idle rule as [`relay`].
///
/// `RelayEnd::SocketClosed` means `client` ended first, `ChannelClosed` means
/// `upstream` did.
pub async fn splice<A, B>(client: A, upstream: B, idle_timeout: Duration) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let touch = || {
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    };

    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let end = {
        let inbound = async {
            copy_counted(&mut client_rx, &mut upstream_tx, &mut bytes_in, &touch).await;
            RelayEnd::SocketClosed
        };
        let outbound = async {
            copy_counted(&mut upstream_rx, &mut client_tx, &mut bytes_out, &touch).await;
            RelayEnd::ChannelClosed
        };
        let idle = async {
            loop {
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                let deadline = started + last + idle_timeout;
                if Instant::now() >= deadline {
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        };

        tokio::select! {
            end = inbound => end,
            end = outbound => end,
            _ = idle => RelayEnd::IdleTimeout,
        }
    };

    let _ = client_tx.shutdown().await;
    let _ = upstream_tx.shutdown().await;

    RelayStats {
        bytes_in,
        bytes_out,
        end,
    }
}

async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, counter: &mut u64, touch: &F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(),
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        touch();
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        *counter += n as u64;
    }
    let _ = writer.flush().await;
}

async fn socket_to_channel<R, F>(
    socket: &mut R,
    channel: &mut ChannelWriter,
    counter: &mut u64,
    touch: &F,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
    F: Fn(),
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => return RelayEnd::SocketClosed,
            Ok(n) => n,
            Err(e) => {
                trace!("Socket read on channel {} failed: {}", channel.stream_id(), e);
                return RelayEnd::SocketClosed;
            }
        };
        touch();
        if channel.write(&buf[..n]).await.is_err() {
            return RelayEnd::ChannelClosed;
        }
        *counter += n as u64;
    }
}

async fn channel_to_socket<W, F>(
    channel: &mut ChannelReader,
    socket: &mut W,
    counter: &mut u64,
    touch: &F,
) -> RelayEnd
where
    W: AsyncWrite + Unpin,
    F: Fn(),
{
    while let Some(chunk) = channel.read().await {
        touch();
        if let Err(e) = socket.write_all(&chunk).await {
            trace!("Socket write on channel {} failed: {}", channel.stream_id(), e);
            return RelayEnd::SocketClosed;
        }
        *counter += chunk.len() as u64;
    }
    let _ = socket.flush().await;
    RelayEnd::ChannelClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMux;
    use kun_proto::TunnelMessage;
    use tokio::sync::mpsc;

    fn wire(from: mpsc::Receiver<TunnelMessage>, to: ChannelMux) {
        let mut from = from;
        tokio::spawn(async move {
            while let Some(msg) = from.recv().await {
                match msg {
                    TunnelMessage::Data { stream_id, data } => {
                        let _ = to.on_data(stream_id, data);
                    }
                    TunnelMessage::WindowUpdate { stream_id, credit } => {
                        to.on_window_update(stream_id, credit)
                    }
                    TunnelMessage::CloseChannel { stream_id } => {
                        to.on_close(stream_id);
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        let a = ChannelMux::new(a_tx, 64 * 1024);
        let b = ChannelMux::new(b_tx, 64 * 1024);
        wire(a_rx, b.clone());
        wire(b_rx, a.clone());

        let channel = a.open().unwrap();
        let mut remote = b.accept(channel.stream_id()).unwrap();

        let (mut public, relay_side) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(relay_side, channel, Duration::from_secs(5)));

        // Remote end echoes what it receives
        tokio::spawn(async move {
            while let Some(chunk) = remote.read().await {
                if remote.write(&chunk).await.is_err() {
                    break;
                }
            }
        });

        public.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");

        drop(public);
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::SocketClosed);
        assert_eq!(stats.bytes_in, 18);
        assert_eq!(stats.bytes_out, 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout() {
        let (tx, _rx) = mpsc::channel(64);
        let mux = ChannelMux::new(tx, 1024);
        let channel = mux.open().unwrap();
        let stream_id = channel.stream_id();

        let (_public, relay_side) = tokio::io::duplex(1024);
        let stats = relay(relay_side, channel, Duration::from_secs(30)).await;

        assert_eq!(stats.end, RelayEnd::IdleTimeout);
        assert!(!mux.is_open(stream_id));
    }

    #[tokio::test]
    async fn test_splice_copies_both_ways() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (upstream_side, mut upstream) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(client_side, upstream_side, Duration::from_secs(5)));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(upstream);
        let stats = task.await.unwrap();
        assert_eq!(stats.end, RelayEnd::ChannelClosed);
        assert_eq!(stats.bytes_in, 5);
        assert_eq!(stats.bytes_out, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_splice_idle_timeout() {
        let (_client, client_side) = tokio::io::duplex(1024);
        let (upstream_side, _upstream) = tokio::io::duplex(1024);
        let stats = splice(client_side, upstream_side, Duration::from_secs(30)).await;
        assert_eq!(stats.end, RelayEnd::IdleTimeout);
    }
}
