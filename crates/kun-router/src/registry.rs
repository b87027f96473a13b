//! Upstream registry: the node-local routing table
//!
//! Maps a domain to the upstream record currently serving it. Writes are
//! last-write-wins per domain (see [`UpstreamRecord::supersedes`]) and are
//! applied under the domain's map entry, so concurrent local registrations
//! and replicated deltas never need a table-wide lock. Expired records are
//! treated as absent by readers even before they are physically removed.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kun_proto::{Endpoint, UpstreamEvent, UpstreamRecord};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default capacity of the change feed per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// A change applied to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Upsert {
        version: u64,
        record: UpstreamRecord,
        previous: Option<UpstreamRecord>,
    },
    Remove {
        version: u64,
        record: UpstreamRecord,
    },
}

impl RegistryEvent {
    /// Local sequence number; increases with every applied change
    pub fn version(&self) -> u64 {
        match self {
            RegistryEvent::Upsert { version, .. } | RegistryEvent::Remove { version, .. } => *version,
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            RegistryEvent::Upsert { record, .. } | RegistryEvent::Remove { record, .. } => {
                &record.domain_name
            }
        }
    }

    /// The delta as replicated to peers
    pub fn to_upstream_event(&self) -> UpstreamEvent {
        match self {
            RegistryEvent::Upsert { record, .. } => UpstreamEvent::Upsert(record.clone()),
            RegistryEvent::Remove { record, .. } => UpstreamEvent::Remove {
                domain: record.domain_name.clone(),
                session_id: record.endpoint.session_id.clone(),
            },
        }
    }

    /// Endpoint that lost the domain to a different session, if any
    pub fn superseded_endpoint(&self) -> Option<&Endpoint> {
        match self {
            RegistryEvent::Upsert {
                record,
                previous: Some(previous),
                ..
            } if previous.endpoint.session_id != record.endpoint.session_id => {
                Some(&previous.endpoint)
            }
            _ => None,
        }
    }
}

/// Result of an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced(UpstreamRecord),
    /// An equal or newer record already exists; nothing changed
    Stale,
}

impl UpsertOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpsertOutcome::Stale)
    }
}

/// Node-local routing table
pub struct UpstreamRegistry {
    records: DashMap<String, UpstreamRecord>,
    events: broadcast::Sender<RegistryEvent>,
    /// Last assigned version; held while an event is published so versions
    /// reach subscribers in order
    version: Mutex<u64>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            records: DashMap::new(),
            events,
            version: Mutex::new(0),
        }
    }

    // Called with the domain's entry locked
    fn publish(&self, make: impl FnOnce(u64) -> RegistryEvent) {
        let mut version = match self.version.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *version += 1;
        let event = make(*version);
        trace!("Registry event v{} for {}", event.version(), event.domain());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply `record` if it is newer than what the registry holds for its domain
    pub fn upsert(&self, record: UpstreamRecord) -> UpsertOutcome {
        match self.records.entry(record.domain_name.clone()) {
            Entry::Occupied(mut entry) => {
                if !record.supersedes(entry.get()) {
                    trace!(
                        "Ignoring stale record {} for {}",
                        record.id,
                        record.domain_name
                    );
                    return UpsertOutcome::Stale;
                }
                let previous = entry.insert(record.clone());
                debug!(
                    "Upstream {} now served by session {} on {}",
                    record.domain_name, record.endpoint.session_id, record.endpoint.node_id
                );
                let event_previous = previous.clone();
                self.publish(|version| RegistryEvent::Upsert {
                    version,
                    record,
                    previous: Some(event_previous),
                });
                UpsertOutcome::Replaced(previous)
            }
            Entry::Vacant(entry) => {
                debug!(
                    "Upstream {} registered by session {} on {}",
                    record.domain_name, record.endpoint.session_id, record.endpoint.node_id
                );
                let _guard = entry.insert(record.clone());
                self.publish(|version| RegistryEvent::Upsert {
                    version,
                    record,
                    previous: None,
                });
                UpsertOutcome::Inserted
            }
        }
    }

    /// Advance `updated_at`/`expired_at` of a record still owned by `session_id`
    pub fn refresh(
        &self,
        domain: &str,
        session_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<UpstreamRecord> {
        let Entry::Occupied(mut entry) = self.records.entry(domain.to_string()) else {
            return None;
        };
        if !entry.get().is_owned_by(session_id) {
            return None;
        }

        let refreshed = entry.get().refreshed(now, ttl);
        if !refreshed.supersedes(entry.get()) {
            return None;
        }

        let previous = entry.insert(refreshed.clone());
        let record = refreshed.clone();
        self.publish(|version| RegistryEvent::Upsert {
            version,
            record,
            previous: Some(previous),
        });
        Some(refreshed)
    }

    /// Remove the record for `domain` only if `session_id` still owns it
    pub fn remove(&self, domain: &str, session_id: &str) -> Option<UpstreamRecord> {
        let Entry::Occupied(entry) = self.records.entry(domain.to_string()) else {
            return None;
        };
        if !entry.get().is_owned_by(session_id) {
            trace!(
                "Not removing {}: owned by {} rather than {}",
                domain,
                entry.get().endpoint.session_id,
                session_id
            );
            return None;
        }

        let record = entry.get().clone();
        let event_record = record.clone();
        self.publish(|version| RegistryEvent::Remove {
            version,
            record: event_record,
        });
        entry.remove();

        debug!("Upstream {} removed (session {})", domain, session_id);
        Some(record)
    }

    /// Live record for `domain`
    pub fn lookup(&self, domain: &str) -> Option<UpstreamRecord> {
        self.lookup_at(domain, Utc::now())
    }

    /// Live record for `domain` as of `now`
    pub fn lookup_at(&self, domain: &str, now: DateTime<Utc>) -> Option<UpstreamRecord> {
        let record = self.records.get(domain)?;
        if record.is_expired(now) {
            trace!("Upstream {} expired at {}", domain, record.expired_at);
            return None;
        }
        Some(record.clone())
    }

    /// Stored record regardless of expiry
    pub fn get(&self, domain: &str) -> Option<UpstreamRecord> {
        self.records.get(domain).map(|r| r.clone())
    }

    /// All live records
    pub fn snapshot(&self) -> Vec<UpstreamRecord> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<UpstreamRecord> {
        self.records
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Domains whose record is owned by `session_id`
    pub fn domains_owned_by(&self, session_id: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|entry| entry.is_owned_by(session_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop expired records. Silent: readers already treat them as absent.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!("Swept {} expired upstream records", removed);
        }
        removed
    }

    /// Change feed. Subscribe before taking a snapshot so no change is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn current_version(&self) -> u64 {
        match self.version.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for UpstreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(domain: &str, session: &str, updated_at: DateTime<Utc>) -> UpstreamRecord {
        UpstreamRecord::new(
            domain,
            Endpoint::new("node-a", "127.0.0.1:7070", session),
            updated_at,
            Duration::seconds(60),
        )
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut all = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                all.push(tail);
            }
        }
        all
    }

    #[test]
    fn test_latest_write_wins_in_any_order() {
        let t0 = Utc::now();
        let writes = vec![
            record("a.example.com", "s1", t0),
            record("a.example.com", "s2", t0 + Duration::seconds(3)),
            record("a.example.com", "s3", t0 + Duration::seconds(1)),
            record("a.example.com", "s4", t0 + Duration::seconds(2)),
        ];
        let winner = writes[1].clone();

        for order in permutations(&writes) {
            let registry = UpstreamRegistry::new();
            for write in &order {
                registry.upsert(write.clone());
            }
            // Duplicated delivery changes nothing
            for write in &order {
                assert!(!registry.upsert(write.clone()).is_applied());
            }
            assert_eq!(registry.get("a.example.com"), Some(winner.clone()));
        }
    }

    #[test]
    fn test_stale_upsert_is_noop() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        let newer = record("a.example.com", "s2", t0 + Duration::seconds(1));
        let older = record("a.example.com", "s1", t0);

        assert_eq!(registry.upsert(newer.clone()), UpsertOutcome::Inserted);
        assert_eq!(registry.upsert(older), UpsertOutcome::Stale);
        assert_eq!(registry.get("a.example.com"), Some(newer));
    }

    #[test]
    fn test_lookup_treats_expired_as_absent() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        registry.upsert(record("a.example.com", "s1", t0));

        assert!(registry
            .lookup_at("a.example.com", t0 + Duration::seconds(30))
            .is_some());
        assert!(registry
            .lookup_at("a.example.com", t0 + Duration::seconds(90))
            .is_none());
        // Still stored until swept
        assert!(registry.get("a.example.com").is_some());
        assert!(registry.lookup_at("b.example.com", t0).is_none());
    }

    #[test]
    fn test_remove_requires_owner() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        registry.upsert(record("a.example.com", "s1", t0));
        registry.upsert(record("a.example.com", "s2", t0 + Duration::seconds(1)));

        // s1 was superseded and must not evict s2
        assert!(registry.remove("a.example.com", "s1").is_none());
        assert!(registry.get("a.example.com").is_some());

        let removed = registry.remove("a.example.com", "s2").unwrap();
        assert_eq!(removed.endpoint.session_id, "s2");
        assert!(registry.get("a.example.com").is_none());
        assert!(registry.remove("a.example.com", "s2").is_none());
    }

    #[test]
    fn test_refresh_only_for_owner() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        let original = record("a.example.com", "s1", t0);
        registry.upsert(original.clone());

        let later = t0 + Duration::seconds(20);
        assert!(registry
            .refresh("a.example.com", "s2", later, Duration::seconds(60))
            .is_none());

        let refreshed = registry
            .refresh("a.example.com", "s1", later, Duration::seconds(60))
            .unwrap();
        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.expired_at, later + Duration::seconds(60));

        // Same instant again is not newer
        assert!(registry
            .refresh("a.example.com", "s1", later, Duration::seconds(60))
            .is_none());
        assert!(registry
            .refresh("missing.example.com", "s1", later, Duration::seconds(60))
            .is_none());
    }

    #[tokio::test]
    async fn test_events_only_for_applied_changes() {
        let registry = UpstreamRegistry::new();
        let mut events = registry.subscribe();
        let t0 = Utc::now();

        let first = record("a.example.com", "s1", t0);
        let second = record("a.example.com", "s2", t0 + Duration::seconds(1));
        registry.upsert(first.clone());
        registry.upsert(first.clone());
        registry.upsert(second.clone());
        registry.remove("a.example.com", "s1");
        registry.remove("a.example.com", "s2");

        let e1 = events.recv().await.unwrap();
        assert_eq!(
            e1,
            RegistryEvent::Upsert {
                version: 1,
                record: first.clone(),
                previous: None
            }
        );

        let e2 = events.recv().await.unwrap();
        assert_eq!(e2.version(), 2);
        assert_eq!(e2.superseded_endpoint(), Some(&first.endpoint));

        let e3 = events.recv().await.unwrap();
        assert_eq!(
            e3,
            RegistryEvent::Remove {
                version: 3,
                record: second.clone()
            }
        );
        assert_eq!(
            e3.to_upstream_event(),
            UpstreamEvent::Remove {
                domain: "a.example.com".to_string(),
                session_id: "s2".to_string()
            }
        );

        assert!(events.try_recv().is_err());
        assert_eq!(registry.current_version(), 3);
    }

    #[test]
    fn test_sweep_is_silent() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        registry.upsert(record("a.example.com", "s1", t0));
        registry.upsert(record("b.example.com", "s1", t0 + Duration::seconds(45)));
        let mut events = registry.subscribe();

        let removed = registry.sweep(t0 + Duration::seconds(90));

        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_and_ownership() {
        let registry = UpstreamRegistry::new();
        let t0 = Utc::now();
        registry.upsert(record("a.example.com", "s1", t0));
        registry.upsert(record("b.example.com", "s1", t0));
        registry.upsert(record("c.example.com", "s2", t0 - Duration::seconds(120)));

        let live = registry.snapshot_at(t0);
        assert_eq!(live.len(), 2);

        let mut owned = registry.domains_owned_by("s1");
        owned.sort();
        assert_eq!(owned, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_concurrent_writers_converge() {
        use std::sync::Arc;

        let registry = Arc::new(UpstreamRegistry::new());
        let t0 = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let at = t0 + Duration::milliseconds((j * 8 + i) as i64);
                        registry.upsert(record("a.example.com", &format!("s{}", i), at));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let winner = registry.get("a.example.com").unwrap();
        assert_eq!(winner.updated_at, t0 + Duration::milliseconds(49 * 8 + 7));
        assert_eq!(winner.endpoint.session_id, "s7");
    }
}
