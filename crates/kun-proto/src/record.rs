//! Upstream records: the routing entries replicated between backend nodes

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Where an upstream record originated: which backend node and which session on it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Node identifier of the backend that terminated the tunnel
    pub node_id: String,
    /// Address of that node's peer listener, used for remote data channels
    pub peer_addr: String,
    /// Tunnel session that owns the domain
    pub session_id: String,
}

impl Endpoint {
    pub fn new(
        node_id: impl Into<String>,
        peer_addr: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            peer_addr: peer_addr.into(),
            session_id: session_id.into(),
        }
    }
}

/// Routing entry mapping a domain to the tunnel session currently serving it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamRecord {
    pub id: String,
    pub domain_name: String,
    pub endpoint: Endpoint,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl UpstreamRecord {
    /// Create a fresh record that lives for `ttl` from `now`
    pub fn new(
        domain_name: impl Into<String>,
        endpoint: Endpoint,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: generate_id(),
            domain_name: domain_name.into(),
            endpoint,
            created_at: now,
            updated_at: now,
            expired_at: now + ttl,
        }
    }

    /// True once `expired_at` has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at <= now
    }

    /// Last-write-wins order: `updated_at` first, record id breaks exact ties
    /// so every node picks the same winner.
    pub fn write_order(&self, other: &UpstreamRecord) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Whether this record should replace `other` for the same domain
    pub fn supersedes(&self, other: &UpstreamRecord) -> bool {
        self.write_order(other) == Ordering::Greater
    }

    /// Whether the record is owned by `session_id`
    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.endpoint.session_id == session_id
    }

    /// Copy of the record with `updated_at` and `expired_at` advanced
    pub fn refreshed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            updated_at: now,
            expired_at: now + ttl,
            ..self.clone()
        }
    }
}

/// Generate a new upstream record id (`upstream-<uuid>`)
pub fn generate_id() -> String {
    format!("upstream-{}", Uuid::new_v4().simple())
}

/// A change to the upstream table as carried between nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpstreamEvent {
    Upsert(UpstreamRecord),
    Remove { domain: String, session_id: String },
}

impl UpstreamEvent {
    pub fn domain(&self) -> &str {
        match self {
            UpstreamEvent::Upsert(record) => &record.domain_name,
            UpstreamEvent::Remove { domain, .. } => domain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(session: &str) -> Endpoint {
        Endpoint::new("node-a", "127.0.0.1:7070", session)
    }

    #[test]
    fn test_new_record_ttl() {
        let now = Utc::now();
        let record = UpstreamRecord::new("a.example.com", endpoint("s1"), now, Duration::seconds(60));

        assert!(record.id.starts_with("upstream-"));
        assert_eq!(record.created_at, now);
        assert_eq!(record.updated_at, now);
        assert_eq!(record.expired_at, now + Duration::seconds(60));
        assert!(!record.is_expired(now + Duration::seconds(59)));
        assert!(record.is_expired(now + Duration::seconds(60)));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_supersedes_by_updated_at() {
        let now = Utc::now();
        let older = UpstreamRecord::new("a.example.com", endpoint("s1"), now, Duration::seconds(60));
        let newer = UpstreamRecord::new(
            "a.example.com",
            endpoint("s2"),
            now + Duration::seconds(1),
            Duration::seconds(60),
        );

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!newer.supersedes(&newer));
    }

    #[test]
    fn test_tie_broken_by_id() {
        let now = Utc::now();
        let mut a = UpstreamRecord::new("a.example.com", endpoint("s1"), now, Duration::seconds(60));
        let mut b = UpstreamRecord::new("a.example.com", endpoint("s2"), now, Duration::seconds(60));
        a.id = "upstream-a".to_string();
        b.id = "upstream-b".to_string();

        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn test_refreshed_keeps_identity() {
        let now = Utc::now();
        let record = UpstreamRecord::new("a.example.com", endpoint("s1"), now, Duration::seconds(60));
        let later = now + Duration::seconds(30);
        let refreshed = record.refreshed(later, Duration::seconds(60));

        assert_eq!(refreshed.id, record.id);
        assert_eq!(refreshed.created_at, record.created_at);
        assert_eq!(refreshed.updated_at, later);
        assert_eq!(refreshed.expired_at, later + Duration::seconds(60));
        assert!(refreshed.supersedes(&record));
    }
}
