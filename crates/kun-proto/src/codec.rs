//! Length-prefixed bincode framing for protocol messages

use crate::messages::{PeerMessage, TunnelMessage};
use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec for any serde message type
///
/// Format: [length: u32 big-endian][payload: bincode serialized message]
pub struct FrameCodec<T> {
    max_frame_size: usize,
    _message: PhantomData<fn() -> T>,
}

/// Codec for the backend control listener
pub type TunnelCodec = FrameCodec<TunnelMessage>;

/// Codec for the peer listener
pub type PeerCodec = FrameCodec<PeerMessage>;

impl<T> FrameCodec<T> {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_frame_size(Self::MAX_MESSAGE_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _message: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_frame_size(self.max_frame_size)
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);
        let msg = bincode::deserialize(&payload)?;

        Ok(Some(msg))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, msg: T, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&msg)?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }
}
