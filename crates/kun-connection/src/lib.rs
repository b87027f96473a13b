//! Connection plumbing for kun
//!
//! TCP/TLS transports framed with the protocol codec, the credit-based data
//! channel multiplexer used inside tunnel sessions, socket relays and
//! reconnect backoff.

pub mod channel;
pub mod reconnect;
pub mod relay;
pub mod tls;
pub mod transport;

pub use channel::{ChannelError, ChannelMux, ChannelReader, ChannelWriter, DataChannel};
pub use reconnect::{Backoff, BackoffConfig, BackoffError};
pub use relay::{relay, splice, RelayEnd, RelayStats};
pub use tls::{ClientAuthMode, ClientTlsConfig, ServerTlsConfig};
pub use transport::{
    accept_stream, bind_address, dial_address, framed, AsyncStream, BoxedStream, Dialer,
    MessageStream, TransportError,
};
