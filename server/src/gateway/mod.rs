//! The gateway proper: connection lifecycle, subscription fan-out, presence.
//!
//! ARCHITECTURE
//! ============
//! [`Gateway`] is the shared state injected into the axum upgrade handler
//! and into every background task. It owns the live-connection set, the
//! subscription registry, and the presence tracker; the platform services
//! and the event bus are injected at construction. Everything inside is
//! `Arc`-wrapped so clones are cheap.
//!
//! The subscription registry references connections only by [`ClientId`];
//! handles are resolved against the live set at dispatch time, and a failed
//! resolution means the client is gone and the delivery is dropped.

pub mod connection;
pub mod presence;
pub mod router;
pub mod subscriptions;
pub mod upgrade;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::Config;
use crate::services::Services;
use connection::{ClientHandle, ClientId};
use messages::ServerMessage;
use presence::PresenceTracker;
use subscriptions::Registry;

struct GatewayInner {
    config: Config,
    bus: Bus,
    services: Services,
    connections: RwLock<HashMap<ClientId, ClientHandle>>,
    registry: Registry,
    presence: PresenceTracker,
}

/// Shared gateway state. Clone freely; all clones view the same gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    #[must_use]
    pub fn new(config: Config, services: Services, bus: Bus) -> Self {
        let presence = PresenceTracker::new(bus.clone());
        Self {
            inner: Arc::new(GatewayInner {
                config,
                bus,
                services,
                connections: RwLock::new(HashMap::new()),
                registry: Registry::new(),
                presence,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    #[must_use]
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Resolve a live connection. `None` means the client disconnected.
    pub async fn client(&self, id: ClientId) -> Option<ClientHandle> {
        self.inner.connections.read().await.get(&id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub(crate) async fn insert_client(&self, handle: ClientHandle) {
        self.inner.connections.write().await.insert(handle.id(), handle);
    }

    pub(crate) async fn remove_client(&self, id: ClientId) {
        self.inner.connections.write().await.remove(&id);
    }

    pub(crate) async fn clients(&self) -> Vec<ClientHandle> {
        self.inner.connections.read().await.values().cloned().collect()
    }

    async fn user_has_other_connection(&self, user: Uuid, excluding: ClientId) -> bool {
        self.inner
            .connections
            .read()
            .await
            .values()
            .any(|c| c.id() != excluding && c.user() == Some(user))
    }

    /// Mark a user online, dispatching a `status` event on first entry.
    pub(crate) fn presence_enter(&self, user: Uuid) {
        self.inner.presence.enter(user);
    }

    /// Mark a user offline unless another live connection still carries them.
    /// Membership is recomputed from the live set rather than counted, so
    /// the two-tabs case resolves correctly as long as each close runs.
    pub(crate) async fn presence_exit_if_last(&self, user: Uuid, leaving: ClientId) {
        if !self.user_has_other_connection(user, leaving).await {
            self.inner.presence.exit(user);
        }
    }

    /// The HTTP surface: the websocket upgrade endpoint plus a health probe.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config().path, get(upgrade::handle_upgrade))
            .route("/healthz", get(healthz))
            .with_state(self.clone())
    }

    /// Spawn the server-initiated heartbeat, if enabled. Each tick pings
    /// every live client; a client that never answered the previous ping is
    /// shut down.
    pub fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let period = self.config().heartbeat_period?;
        let gateway = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; clients get a full period
            // before their first ping.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for client in gateway.clients().await {
                    if client.begin_ping() {
                        client.safe_send(ServerMessage::Ping).await;
                    } else {
                        warn!(client_id = %client.id(), "heartbeat unanswered; closing connection");
                        client.request_shutdown();
                    }
                }
            }
        }))
    }

    /// Spawn an observer that logs lifecycle events at debug level.
    pub fn spawn_lifecycle_logger(&self) -> JoinHandle<()> {
        let mut rx = self.bus().subscribe_lifecycle();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => debug!(?event, "gateway lifecycle"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "lifecycle observer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// TEST FIXTURES
// =============================================================================
