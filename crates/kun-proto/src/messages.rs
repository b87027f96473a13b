//! Protocol message types

use crate::record::UpstreamEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream identifier of a data channel inside a tunnel session
pub type StreamId = u32;

/// Messages exchanged on the backend control listener.
///
/// The first message of a connection selects the call: `Login`, `Connect`
/// or `WatchTunnels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    // Login call
    Login {
        access_key_id: String,
        secret: String,
    },
    LoginOk {
        token: String,
        expires_at: DateTime<Utc>,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },

    // Tunnel session handshake
    Connect {
        credentials: Credentials,
    },
    Connected {
        session_id: String,
        heartbeat_interval_secs: u64,
        ttl_secs: u64,
    },

    // Session control (client -> server)
    RegisterDomain {
        domain: String,
    },
    Heartbeat {
        timestamp: u64,
    },

    // Session control (server -> client)
    DomainRegistered {
        domain: String,
        expired_at: DateTime<Utc>,
    },
    DomainRejected {
        domain: String,
        reason: RejectReason,
        message: String,
    },
    DomainSuperseded {
        domain: String,
    },
    HeartbeatAck {
        timestamp: u64,
    },

    // Data channels (both directions except OpenChannel)
    OpenChannel {
        stream_id: StreamId,
        domain: String,
        remote_addr: String,
    },
    Data {
        stream_id: StreamId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: StreamId,
        credit: u32,
    },
    CloseChannel {
        stream_id: StreamId,
    },

    Close {
        reason: String,
    },

    // Watch call
    WatchTunnels {
        domain_filter: Option<String>,
    },
    TunnelEvent(TunnelEvent),
}

impl TunnelMessage {
    /// Stream the message belongs to, if it is a data-channel message
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            TunnelMessage::OpenChannel { stream_id, .. }
            | TunnelMessage::Data { stream_id, .. }
            | TunnelMessage::WindowUpdate { stream_id, .. }
            | TunnelMessage::CloseChannel { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        TunnelMessage::Rejected {
            reason,
            message: message.into(),
        }
    }
}

/// Client credentials presented on `Connect`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Credentials {
    AccessKey {
        access_key_id: String,
        secret: String,
    },
    /// Token previously issued by `Login`
    Token(String),
}

/// Why a call or a domain registration was refused
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    AuthFailed,
    PermissionDenied,
    /// A live session elsewhere owns the domain
    DomainInUse,
    /// A newer registration from another session took the domain
    DomainConflict,
    InvalidDomain,
    SessionNotActive,
    ProtocolError,
    Internal,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::AuthFailed => "authentication failed",
            RejectReason::PermissionDenied => "permission denied",
            RejectReason::DomainInUse => "domain in use",
            RejectReason::DomainConflict => "domain conflict",
            RejectReason::InvalidDomain => "invalid domain",
            RejectReason::SessionNotActive => "session not active",
            RejectReason::ProtocolError => "protocol error",
            RejectReason::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Session lifecycle event published on the watch feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelEvent {
    pub session_id: String,
    pub access_key_id: String,
    pub kind: TunnelEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TunnelEventKind {
    Connected,
    DomainRegistered(String),
    DomainReleased(String),
    Closed,
}

impl TunnelEvent {
    pub fn new(
        session_id: impl Into<String>,
        access_key_id: impl Into<String>,
        kind: TunnelEventKind,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            access_key_id: access_key_id.into(),
            kind,
            at: Utc::now(),
        }
    }

    /// Domain the event concerns, if any
    pub fn domain(&self) -> Option<&str> {
        match &self.kind {
            TunnelEventKind::DomainRegistered(d) | TunnelEventKind::DomainReleased(d) => Some(d),
            _ => None,
        }
    }
}

/// Messages exchanged on the peer listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PeerMessage {
    /// Open a full-duplex replication link
    ConnectUpstream {
        node_id: String,
    },
    /// Subscribe one-way to the remote upstream table
    WatchUpstream {
        node_id: String,
    },
    Accepted {
        node_id: String,
    },
    Rejected {
        message: String,
    },

    Event {
        version: u64,
        event: UpstreamEvent,
    },
    /// Every live record of the sender's table has been sent
    SnapshotComplete {
        version: u64,
    },
    Ack {
        version: u64,
    },

    /// Forward one data channel to a session terminated on the remote node.
    /// After `ChannelOpened` the connection carries raw bytes.
    OpenChannel {
        session_id: String,
        domain: String,
        remote_addr: String,
    },
    ChannelOpened,
    ChannelRejected {
        reason: RejectReason,
    },
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Endpoint, UpstreamRecord};

    #[test]
    fn test_message_serialization() {
        let msg = TunnelMessage::Heartbeat { timestamp: 12345 };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_data_message() {
        let msg = TunnelMessage::Data {
            stream_id: 42,
            data: vec![1, 2, 3, 4, 5],
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();

        assert_eq!(deserialized.stream_id(), Some(42));
        if let TunnelMessage::Data { data, .. } = deserialized {
            assert_eq!(data, vec![1, 2, 3, 4, 5]);
        } else {
            panic!("Expected Data message");
        }
    }

    #[test]
    fn test_control_messages_have_no_stream() {
        assert_eq!(
            TunnelMessage::RegisterDomain {
                domain: "a.example.com".to_string()
            }
            .stream_id(),
            None
        );
        assert_eq!(TunnelMessage::CloseChannel { stream_id: 7 }.stream_id(), Some(7));
    }

    #[test]
    fn test_peer_event_serialization() {
        let record = UpstreamRecord::new(
            "a.example.com",
            Endpoint::new("node-a", "10.0.0.1:7070", "session-1"),
            Utc::now(),
            chrono::Duration::seconds(60),
        );
        let msg = PeerMessage::Event {
            version: 3,
            event: UpstreamEvent::Upsert(record),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: PeerMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_tunnel_event_domain() {
        let event = TunnelEvent::new(
            "s1",
            "key-1",
            TunnelEventKind::DomainRegistered("a.example.com".to_string()),
        );
        assert_eq!(event.domain(), Some("a.example.com"));
        assert_eq!(TunnelEvent::new("s1", "key-1", TunnelEventKind::Closed).domain(), None);
    }
}
