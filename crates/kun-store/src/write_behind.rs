//! Background task mirroring registry changes into the store

use crate::store::UpstreamStore;
use kun_router::{RegistryEvent, UpstreamRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Persist registry changes until cancelled.
///
/// Store failures are logged and skipped; routing never waits on the database.
pub async fn run_write_behind(
    store: UpstreamStore,
    registry: Arc<UpstreamRegistry>,
    cancel: CancellationToken,
) {
    let mut events = registry.subscribe();
    info!("Upstream write-behind started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => apply(&store, &event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Write-behind lagged by {} events, resyncing from snapshot", skipped);
                resync(&store, &registry).await;
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("Upstream write-behind stopped");
}

/// Make the store match the live registry: save every live record and
/// soft-delete stored rows that are no longer in it.
pub async fn resync(store: &UpstreamStore, registry: &UpstreamRegistry) {
    let live = registry.snapshot();
    let live_ids: HashSet<&str> = live.iter().map(|r| r.id.as_str()).collect();

    for record in &live {
        if let Err(e) = store.save(record).await {
            warn!(domain = %record.domain_name, "Failed to persist upstream: {}", e);
        }
    }

    let stored = match store.list().await {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Failed to list stored upstreams: {}", e);
            return;
        }
    };
    let mut deleted = 0;
    for record in stored.iter().filter(|r| !live_ids.contains(r.id.as_str())) {
        match store.soft_delete(&record.id).await {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(e) => warn!(id = %record.id, "Failed to soft-delete stale upstream: {}", e),
        }
    }
    info!(live = live.len(), deleted, "Upstream store resynced");
}

async fn apply(store: &UpstreamStore, event: &RegistryEvent) {
    match event {
        RegistryEvent::Upsert {
            record, previous, ..
        } => {
            if let Some(previous) = previous {
                if previous.id != record.id {
                    if let Err(e) = store.soft_delete(&previous.id).await {
                        warn!(id = %previous.id, "Failed to soft-delete replaced upstream: {}", e);
                    }
                }
            }
            match store.save(record).await {
                Ok(_) => debug!(domain = %record.domain_name, "Upstream persisted"),
                Err(e) => warn!(domain = %record.domain_name, "Failed to persist upstream: {}", e),
            }
        }
        RegistryEvent::Remove { record, .. } => {
            if let Err(e) = store.soft_delete(&record.id).await {
                warn!(id = %record.id, "Failed to soft-delete upstream: {}", e);
            }
        }
    }
}
