//! Routing-table scenarios across time and across nodes

use chrono::{Duration, Utc};
use kun_proto::{Endpoint, UpstreamEvent, UpstreamRecord};
use kun_router::{RegistryEvent, UpstreamRegistry};

fn apply(registry: &UpstreamRegistry, event: UpstreamEvent) {
    match event {
        UpstreamEvent::Upsert(record) => {
            registry.upsert(record);
        }
        UpstreamEvent::Remove { domain, session_id } => {
            registry.remove(&domain, &session_id);
        }
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RegistryEvent>) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.to_upstream_event());
    }
    events
}

#[test]
fn test_registration_expires_without_heartbeat() {
    let registry = UpstreamRegistry::new();
    let t0 = Utc::now();
    let record = UpstreamRecord::new(
        "a.example.com",
        Endpoint::new("node-a", "10.0.0.1:7070", "session-1"),
        t0,
        Duration::seconds(60),
    );
    registry.upsert(record.clone());

    let at_30s = registry.lookup_at("a.example.com", t0 + Duration::seconds(30));
    assert_eq!(at_30s, Some(record));

    let at_90s = registry.lookup_at("a.example.com", t0 + Duration::seconds(90));
    assert!(at_90s.is_none());
}

#[test]
fn test_two_nodes_converge_on_latest_registration() {
    let node_a = UpstreamRegistry::new();
    let node_b = UpstreamRegistry::new();
    let mut feed_a = node_a.subscribe();
    let mut feed_b = node_b.subscribe();

    let t0 = Utc::now();
    let from_a = UpstreamRecord::new(
        "b.example.com",
        Endpoint::new("node-a", "10.0.0.1:7070", "session-a"),
        t0,
        Duration::seconds(60),
    );
    let from_b = UpstreamRecord::new(
        "b.example.com",
        Endpoint::new("node-b", "10.0.0.2:7070", "session-b"),
        t0 + Duration::seconds(1),
        Duration::seconds(60),
    );
    node_a.upsert(from_a);
    node_b.upsert(from_b.clone());

    // Exchange deltas until nothing new is produced
    loop {
        let out_a = drain(&mut feed_a);
        let out_b = drain(&mut feed_b);
        if out_a.is_empty() && out_b.is_empty() {
            break;
        }
        for event in out_a {
            apply(&node_b, event);
        }
        for event in out_b {
            apply(&node_a, event);
        }
    }

    assert_eq!(node_a.lookup_at("b.example.com", t0), Some(from_b.clone()));
    assert_eq!(node_b.lookup_at("b.example.com", t0), Some(from_b));
}

#[test]
fn test_removal_of_superseded_session_does_not_propagate_loss() {
    let node_a = UpstreamRegistry::new();
    let node_b = UpstreamRegistry::new();
    let t0 = Utc::now();

    let old = UpstreamRecord::new(
        "c.example.com",
        Endpoint::new("node-a", "10.0.0.1:7070", "session-old"),
        t0,
        Duration::seconds(60),
    );
    let new = UpstreamRecord::new(
        "c.example.com",
        Endpoint::new("node-b", "10.0.0.2:7070", "session-new"),
        t0 + Duration::seconds(5),
        Duration::seconds(60),
    );

    node_a.upsert(old.clone());
    node_b.upsert(new.clone());
    node_a.upsert(new.clone());

    // The old session closes on node A after being superseded
    assert!(node_a.remove("c.example.com", "session-old").is_none());
    apply(
        &node_b,
        UpstreamEvent::Remove {
            domain: "c.example.com".to_string(),
            session_id: "session-old".to_string(),
        },
    );

    assert_eq!(node_a.get("c.example.com"), Some(new.clone()));
    assert_eq!(node_b.get("c.example.com"), Some(new));
}
