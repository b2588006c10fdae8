use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use cinemate_core::auth::UpstreamSessionAuth;
use cinemate_core::config::load_config;
use cinemate_core::logging;
use cinemate_core::persist::{HttpMessageStore, MessageStore, NoopMessageStore};

use cinemate_relay::bridge::BrokerBridge;
use cinemate_relay::dispatcher::Dispatcher;
use cinemate_relay::registry::DestinationRegistry;
use cinemate_relay::server::{router, spawn_idle_sweeper, AppState};
use cinemate_relay::session::SessionManager;

/// Generate a unique node ID for this relay instance
fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = nanoid::nanoid!(6);
    format!("{host}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Cinemate relay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Persistence collaborator (best-effort, external)
    let store: Arc<dyn MessageStore> = if config.persistence.enabled {
        info!("Persisting chat messages to {}", config.persistence.base_url);
        Arc::new(HttpMessageStore::new(&config.persistence)?)
    } else {
        warn!("Persistence disabled, chat messages are relay-only");
        Arc::new(NoopMessageStore)
    };

    // 4. Registry and dispatcher shared by both transports
    let registry = Arc::new(DestinationRegistry::new());
    let dispatcher = Dispatcher::new(registry.clone());
    let sessions = SessionManager::new();

    // 5. External broker bridge for cross-process fan-out
    let (bridge, bridge_handle) = if config.broker.enabled {
        let node_id = generate_node_id();
        info!(node_id = %node_id, "Connecting broker bridge to {}", config.broker.url);
        let bridge = Arc::new(BrokerBridge::new(
            config.broker.clone(),
            dispatcher.clone(),
            node_id,
        )?);
        let handle = bridge.start();
        (Some(bridge), Some(handle))
    } else {
        warn!("Broker bridge disabled, running single-process");
        (None, None)
    };

    let state = AppState::with_parts(
        registry,
        dispatcher,
        sessions,
        store,
        Arc::new(UpstreamSessionAuth),
        bridge_handle,
        config.relay.clone(),
    );

    // 6. Idle sweeper closes connections that stop heartbeating
    let sweeper = spawn_idle_sweeper(
        state.sessions.clone(),
        Duration::from_secs(config.relay.sweep_interval_seconds),
        Duration::from_secs(config.relay.idle_timeout_seconds),
    );

    // 7. Serve both transports
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("Relay listening on {}", config.http_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    sweeper.abort();
    if let Some(bridge) = bridge {
        bridge.shutdown();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
