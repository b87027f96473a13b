//! Wiring of one backend node: registry, sessions, peers, frontends and store

use crate::config::{Configuration, TlsSection};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use kun_auth::{AuthPlugin, Authenticator, PluginRegistry, TokenIssuer};
use kun_connection::{bind_address, dial_address, BackoffConfig, Dialer};
use kun_control::{BackendControlServer, NodeInfo, SessionConfig, SessionManager};
use kun_frontend::{FrontendConfig, FrontendRouter, FrontendServer, ListenerMode};
use kun_peer::{PeerReplicator, PeerServer};
use kun_router::UpstreamRegistry;
use kun_store::UpstreamStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Build the auth plugin named in the configuration
pub async fn create_auth_plugin(
    config: &Configuration,
    plugins: &PluginRegistry,
) -> Result<Arc<dyn AuthPlugin>> {
    plugins
        .create(&config.auth)
        .await
        .with_context(|| format!("Failed to set up auth method {}", config.auth.method))
}

fn acceptor(tls: &TlsSection, what: &str) -> Result<Option<TlsAcceptor>> {
    match tls.server_config()? {
        Some(server) => Ok(Some(
            server
                .acceptor()
                .with_context(|| format!("Failed to load {} certificate", what))?,
        )),
        None => Ok(None),
    }
}

fn chrono_duration(duration: Duration) -> Result<ChronoDuration> {
    ChronoDuration::from_std(duration).context("duration out of range")
}

/// Run a node until `cancel` fires.
///
/// Every listener is bound before anything starts serving, so a busy port
/// fails startup instead of leaving a half-running node.
pub async fn run(config: Configuration, cancel: CancellationToken) -> Result<()> {
    let plugins = PluginRegistry::with_builtins();
    let plugin = create_auth_plugin(&config, &plugins).await?;

    let token_validity = chrono_duration(config.backend.token_validity)?;
    let tokens = match &config.backend.token_secret {
        Some(secret) => TokenIssuer::new(secret.as_bytes(), token_validity),
        None => {
            warn!("No backend.token_secret configured, login tokens will not survive a restart");
            TokenIssuer::ephemeral(token_validity)
        }
    };
    let auth = Authenticator::new(plugin, tokens);

    let node_id = config
        .peer
        .node_id
        .clone()
        .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple()));
    let advertise = match &config.peer.advertise_addr {
        Some(addr) => dial_address(addr)?,
        None => dial_address(&config.peer.bind)?,
    };
    let node = NodeInfo::new(node_id.clone(), advertise.clone());
    info!(node_id = %node_id, peer_addr = %advertise, "Starting kun node");

    let registry = Arc::new(UpstreamRegistry::new());
    let session_config = SessionConfig {
        heartbeat_interval: config.backend.heartbeat_interval,
        heartbeat_timeout: config.backend.heartbeat_timeout,
        record_ttl: config.registry.ttl,
        ..SessionConfig::default()
    };
    let manager = Arc::new(SessionManager::new(
        node,
        session_config,
        registry.clone(),
        auth.clone(),
    ));

    // Outbound peer connections, also used for remote routing
    let peer_dialer = if config.peer.tls.is_enabled() {
        let connector = config
            .peer
            .tls
            .client_config()
            .connector()
            .context("Failed to set up peer TLS client")?;
        Dialer::tls(connector)
    } else {
        Dialer::plain()
    }
    .with_connect_timeout(config.peer.handshake_timeout);

    let peer_listener = PeerServer::bind(&bind_address(&config.peer.bind)).await?;
    let control_listener = BackendControlServer::bind(&bind_address(&config.backend.bind)).await?;

    let frontend_tls = acceptor(&config.frontend.tls, "frontend")?;
    let mut frontend_listeners = Vec::new();
    if let Some(addr) = config.frontend.http.as_deref().filter(|a| !a.is_empty()) {
        let listener = FrontendServer::bind(&bind_address(addr)).await?;
        frontend_listeners.push((listener, ListenerMode::Http));
    }
    if let Some(addr) = config.frontend.https.as_deref().filter(|a| !a.is_empty()) {
        match &frontend_tls {
            Some(tls) => {
                let listener = FrontendServer::bind(&bind_address(addr)).await?;
                frontend_listeners.push((listener, ListenerMode::Https(tls.clone())));
            }
            None => info!("No frontend certificate configured, HTTPS listener disabled"),
        }
    }
    if let Some(addr) = config.frontend.passthrough.as_deref().filter(|a| !a.is_empty()) {
        let listener = FrontendServer::bind(&bind_address(addr)).await?;
        frontend_listeners.push((listener, ListenerMode::Passthrough));
    }

    let store = match &config.store.database_url {
        Some(url) => {
            let db = kun_store::connect(url)
                .await
                .context("Failed to connect to the database")?;
            kun_store::migrate(&db)
                .await
                .context("Failed to run database migrations")?;
            Some(UpstreamStore::new(db))
        }
        None => None,
    };

    let mut tasks = JoinSet::new();

    tasks.spawn(manager.clone().run_supervisor(cancel.clone()));

    if let Some(store) = store {
        tasks.spawn(kun_store::run_write_behind(
            store,
            registry.clone(),
            cancel.clone(),
        ));
    }

    if let Some(interval) = config.registry.cleanup_interval {
        tasks.spawn(run_sweeper(registry.clone(), interval, cancel.clone()));
    }

    let replicator = Arc::new(
        PeerReplicator::new(
            node_id.clone(),
            config.peer.members.clone(),
            registry.clone(),
            peer_dialer.clone(),
        )
        .with_handshake_timeout(config.peer.handshake_timeout)
        .with_backoff(BackoffConfig {
            initial_backoff: config.peer.initial_backoff,
            max_backoff: config.peer.max_backoff,
            ..BackoffConfig::default()
        }),
    );
    tasks.spawn(replicator.run(cancel.clone()));

    let mut peer_server = PeerServer::new(manager.clone())
        .with_handshake_timeout(config.peer.handshake_timeout)
        .with_relay_idle_timeout(config.frontend.idle_timeout);
    if let Some(tls) = acceptor(&config.peer.tls, "peer")? {
        peer_server = peer_server.with_tls(tls);
    }
    tasks.spawn(Arc::new(peer_server).serve(peer_listener, cancel.clone()));

    let router = Arc::new(FrontendRouter::new(
        manager.clone(),
        peer_dialer,
        FrontendConfig {
            idle_timeout: config.frontend.idle_timeout,
            read_timeout: config.frontend.read_timeout,
            ..FrontendConfig::default()
        },
    ));
    let frontend = Arc::new(FrontendServer::new(router));
    for (listener, mode) in frontend_listeners {
        tasks.spawn(frontend.clone().serve(listener, mode, cancel.clone()));
    }

    let mut control = BackendControlServer::new(manager.clone())
        .with_handshake_timeout(config.backend.handshake_timeout);
    if let Some(tls) = acceptor(&config.backend.tls, "backend")? {
        control = control.with_tls(tls);
    }
    let control = Arc::new(control);
    let control_cancel = cancel.clone();
    tasks.spawn(async move {
        if let Err(e) = control.serve(control_listener, control_cancel).await {
            warn!("Backend control server failed: {}", e);
        }
    });

    cancel.cancelled().await;
    info!("Shutting down, waiting up to {:?} for tasks", SHUTDOWN_GRACE);

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Task ended abnormally: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after {:?}, aborting", SHUTDOWN_GRACE);
        tasks.abort_all();
    }

    if let Err(e) = auth.close().await {
        warn!("Closing auth plugin failed: {}", e);
    }
    info!("kun node {} stopped", node_id);
    Ok(())
}

async fn run_sweeper(registry: Arc<UpstreamRegistry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry.sweep(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kun_proto::{Endpoint, UpstreamRecord};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_expired_records() {
        let registry = Arc::new(UpstreamRegistry::new());
        let now = Utc::now();
        registry.upsert(UpstreamRecord::new(
            "old.example.com",
            Endpoint::new("node-a", "127.0.0.1:7070", "session-1"),
            now - ChronoDuration::seconds(120),
            ChronoDuration::seconds(60),
        ));
        assert_eq!(registry.len(), 1);

        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(run_sweeper(
            registry.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
