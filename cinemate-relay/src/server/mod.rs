//! WebSocket server exposing the two relay transports
//!
//! `/ws` speaks the raw frame protocol, `/socket` the verb-style room
//! channel. Both are thin adapters over the shared registry, dispatcher
//! and room channel; neither owns any fan-out logic of its own.

pub mod frame_ws;
pub mod room_ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use cinemate_core::auth::Authenticator;
use cinemate_core::config::RelayConfig;
use cinemate_core::persist::MessageStore;

use crate::bridge::BridgeHandle;
use crate::dispatcher::Dispatcher;
use crate::registry::DestinationRegistry;
use crate::room::RoomChannel;
use crate::session::SessionManager;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DestinationRegistry>,
    pub dispatcher: Dispatcher,
    pub sessions: SessionManager,
    pub room: RoomChannel,
    pub store: Arc<dyn MessageStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub bridge: Option<BridgeHandle>,
    pub relay_config: RelayConfig,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
        bridge: Option<BridgeHandle>,
        relay_config: RelayConfig,
    ) -> Self {
        let registry = Arc::new(DestinationRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        Self::with_parts(
            registry,
            dispatcher,
            SessionManager::new(),
            store,
            authenticator,
            bridge,
            relay_config,
        )
    }

    /// Assemble state from pre-built parts (the bridge is constructed
    /// against the dispatcher before the state exists)
    #[must_use]
    pub fn with_parts(
        registry: Arc<DestinationRegistry>,
        dispatcher: Dispatcher,
        sessions: SessionManager,
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
        bridge: Option<BridgeHandle>,
        relay_config: RelayConfig,
    ) -> Self {
        let room = RoomChannel::new(
            registry.clone(),
            dispatcher.clone(),
            sessions.clone(),
            store.clone(),
            bridge.clone(),
        );

        Self {
            registry,
            dispatcher,
            sessions,
            room,
            store,
            authenticator,
            bridge,
            relay_config,
        }
    }
}

/// Build the relay router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(frame_ws::frame_ws_handler))
        .route("/socket", get(room_ws::room_ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness endpoint reporting broker link state and relay load
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let broker = state
        .bridge
        .as_ref()
        .map_or("disabled", |bridge| bridge.state().as_str());

    Json(serde_json::json!({
        "status": "ok",
        "broker": broker,
        "connections": state.sessions.connection_count(),
        "destinations": state.registry.destination_count(),
    }))
}

/// Close connections that stopped heartbeating. Cancelling a session's
/// token drives its tasks through the normal disconnect path, so
/// deregistration happens exactly like an explicit close.
pub fn spawn_idle_sweeper(
    sessions: SessionManager,
    sweep_interval: Duration,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            for connection_id in sessions.idle_connections(idle_timeout) {
                info!(connection_id = %connection_id, "Closing idle connection");
                sessions.cancel(&connection_id);
            }
        }
    })
}
