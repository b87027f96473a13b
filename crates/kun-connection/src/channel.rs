//! Data channels multiplexed over one tunnel session
//!
//! Every channel has a credit window: a writer may have at most `window`
//! unconsumed bytes in flight. The reading side hands credit back with
//! `WindowUpdate` as the application consumes data, so a stalled reader
//! suspends the remote writer instead of growing buffers.
//!
//! Outbound frames of all channels go through one ordered queue owned by
//! the session writer, which keeps bytes of a stream in order.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kun_proto::{StreamId, TunnelMessage, MAX_DATA_CHUNK};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace, warn};

/// Data channel errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel {0} closed")]
    Closed(StreamId),

    #[error("Session closed")]
    SessionClosed,

    #[error("Channel {0} already open")]
    DuplicateStream(StreamId),

    #[error("Channel {stream_id} exceeded its window ({buffered} > {window} bytes)")]
    WindowExceeded {
        stream_id: StreamId,
        buffered: u32,
        window: u32,
    },
}

struct ChannelSlot {
    inbound: mpsc::UnboundedSender<Bytes>,
    credit: Arc<Semaphore>,
    buffered: Arc<AtomicU32>,
}

struct MuxInner {
    channels: DashMap<StreamId, ChannelSlot>,
    outbound: mpsc::Sender<TunnelMessage>,
    next_stream_id: AtomicU32,
    window: u32,
    closed: AtomicBool,
}

impl MuxInner {
    /// Drop a channel locally; returns whether it was still open
    fn remove(&self, stream_id: StreamId) -> bool {
        match self.channels.remove(&stream_id) {
            Some((_, slot)) => {
                slot.credit.close();
                true
            }
            None => false,
        }
    }

    /// Queue a `CloseChannel` without waiting for queue space
    fn send_close(&self, stream_id: StreamId) {
        let msg = TunnelMessage::CloseChannel { stream_id };
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    handle.spawn(async move {
                        let _ = outbound.send(msg).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Channel table of one tunnel session
#[derive(Clone)]
pub struct ChannelMux {
    inner: Arc<MuxInner>,
}

impl ChannelMux {
    /// `outbound` is the session's ordered writer queue, `window` the credit
    /// granted to each side of every channel.
    pub fn new(outbound: mpsc::Sender<TunnelMessage>, window: u32) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                channels: DashMap::new(),
                outbound,
                next_stream_id: AtomicU32::new(1),
                window: window.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn window(&self) -> u32 {
        self.inner.window
    }

    /// Allocate a stream id and open a channel for it (the side that
    /// initiates channels). Stream id 0 is never used.
    pub fn open(&self) -> Result<DataChannel, ChannelError> {
        loop {
            let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
            if stream_id == 0 {
                continue;
            }
            match self.insert(stream_id) {
                Err(ChannelError::DuplicateStream(_)) => continue,
                other => return other,
            }
        }
    }

    /// Open a channel whose stream id was allocated by the remote side
    pub fn accept(&self, stream_id: StreamId) -> Result<DataChannel, ChannelError> {
        self.insert(stream_id)
    }

    fn insert(&self, stream_id: StreamId) -> Result<DataChannel, ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::SessionClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.inner.window as usize));
        let buffered = Arc::new(AtomicU32::new(0));

        match self.inner.channels.entry(stream_id) {
            Entry::Occupied(_) => return Err(ChannelError::DuplicateStream(stream_id)),
            Entry::Vacant(entry) => {
                entry.insert(ChannelSlot {
                    inbound: tx,
                    credit: credit.clone(),
                    buffered: buffered.clone(),
                });
            }
        }

        // close_all may have run between the check and the insert
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.remove(stream_id);
            return Err(ChannelError::SessionClosed);
        }

        debug!("Opened data channel {}", stream_id);

        Ok(DataChannel {
            reader: ChannelReader {
                stream_id,
                inbound: rx,
                buffered,
                inner: self.inner.clone(),
            },
            writer: ChannelWriter {
                stream_id,
                credit,
                inner: self.inner.clone(),
                chunk_size: MAX_DATA_CHUNK.min(self.inner.window as usize),
                closed: false,
            },
        })
    }

    /// Deliver a `Data` frame received from the remote side.
    ///
    /// A frame that overruns the granted window resets the channel.
    pub fn on_data(&self, stream_id: StreamId, data: Vec<u8>) -> Result<(), ChannelError> {
        let len = data.len() as u32;
        let overrun = {
            let Some(slot) = self.inner.channels.get(&stream_id) else {
                trace!("Dropping {} bytes for unknown channel {}", len, stream_id);
                return Ok(());
            };

            let buffered = slot.buffered.fetch_add(len, Ordering::AcqRel) + len;
            if buffered > self.inner.window {
                Some(buffered)
            } else {
                if slot.inbound.send(Bytes::from(data)).is_err() {
                    trace!("Reader of channel {} is gone, discarding data", stream_id);
                }
                None
            }
        };

        if let Some(buffered) = overrun {
            warn!(
                "Channel {} overran its window ({} > {}), resetting",
                stream_id, buffered, self.inner.window
            );
            self.inner.remove(stream_id);
            self.inner.send_close(stream_id);
            return Err(ChannelError::WindowExceeded {
                stream_id,
                buffered,
                window: self.inner.window,
            });
        }

        Ok(())
    }

    /// Return send credit granted by the remote reader
    pub fn on_window_update(&self, stream_id: StreamId, credit: u32) {
        if let Some(slot) = self.inner.channels.get(&stream_id) {
            slot.credit.add_permits(credit as usize);
        }
    }

    /// The remote side closed the channel. Buffered data stays readable.
    pub fn on_close(&self, stream_id: StreamId) -> bool {
        let removed = self.inner.remove(stream_id);
        if removed {
            debug!("Data channel {} closed by remote", stream_id);
        }
        removed
    }

    /// Force-close every channel; no new channel can be opened afterwards
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<StreamId> = self.inner.channels.iter().map(|e| *e.key()).collect();
        for stream_id in ids {
            self.inner.remove(stream_id);
        }
    }

    pub fn is_open(&self, stream_id: StreamId) -> bool {
        self.inner.channels.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.is_empty()
    }
}

/// One logical byte stream inside a tunnel session
pub struct DataChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl DataChannel {
    pub fn stream_id(&self) -> StreamId {
        self.writer.stream_id
    }

    pub async fn read(&mut self) -> Option<Bytes> {
        self.reader.read().await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.writer.write(data).await
    }

    pub async fn close(self) {
        self.writer.close().await
    }

    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a data channel
pub struct ChannelReader {
    stream_id: StreamId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    buffered: Arc<AtomicU32>,
    inner: Arc<MuxInner>,
}

impl ChannelReader {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Next chunk from the remote side; `None` once the channel is closed
    /// and everything buffered has been read.
    pub async fn read(&mut self) -> Option<Bytes> {
        let chunk = self.inbound.recv().await?;
        let len = chunk.len() as u32;
        self.buffered.fetch_sub(len, Ordering::AcqRel);

        if len > 0 && self.inner.channels.contains_key(&self.stream_id) {
            let _ = self
                .inner
                .outbound
                .send(TunnelMessage::WindowUpdate {
                    stream_id: self.stream_id,
                    credit: len,
                })
                .await;
        }

        Some(chunk)
    }
}

/// Sending half of a data channel. Dropping it closes the channel.
pub struct ChannelWriter {
    stream_id: StreamId,
    credit: Arc<Semaphore>,
    inner: Arc<MuxInner>,
    chunk_size: usize,
    closed: bool,
}

impl ChannelWriter {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Send `data`, suspending while the remote window is exhausted
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.stream_id));
        }

        for chunk in data.chunks(self.chunk_size) {
            let permit = self
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| ChannelError::Closed(self.stream_id))?;
            permit.forget();

            self.inner
                .outbound
                .send(TunnelMessage::Data {
                    stream_id: self.stream_id,
                    data: chunk.to_vec(),
                })
                .await
                .map_err(|_| ChannelError::SessionClosed)?;
        }

        Ok(())
    }

    /// Close the channel on both sides
    pub async fn close(mut self) {
        self.closed = true;
        if self.inner.remove(self.stream_id) {
            let _ = self
                .inner
                .outbound
                .send(TunnelMessage::CloseChannel {
                    stream_id: self.stream_id,
                })
                .await;
            debug!("Data channel {} closed", self.stream_id);
        }
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if !self.closed && self.inner.remove(self.stream_id) {
            self.inner.send_close(self.stream_id);
        }
    }
}
