//! Kun protocol definitions
//!
//! Wire messages for the backend control listener and the peer listener,
//! the replicated upstream record, and the frame codec shared by both.

pub mod codec;
pub mod messages;
pub mod record;

pub use codec::{CodecError, FrameCodec, PeerCodec, TunnelCodec};
pub use messages::*;
pub use record::{generate_id, Endpoint, UpstreamEvent, UpstreamRecord};

/// Initial per-channel send window granted to the peer (256 KiB)
pub const DEFAULT_CHANNEL_WINDOW: u32 = 256 * 1024;

/// Largest payload carried by a single `Data` message (16 KiB)
pub const MAX_DATA_CHUNK: usize = 16 * 1024;
