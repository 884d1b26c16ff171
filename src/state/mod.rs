pub mod estimation;
pub mod message;
pub mod participant;
pub mod registry;
pub mod team;

use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::config::AppConfig;
use crate::dao::team_store::TeamStore;

pub use self::registry::{Lookup, TeamGuard, TeamRegistry};

/// Shared handle to the application state.
pub type SharedState = Arc<AppState>;

/// Central application state: this node's identity, the team registry, and
/// the optional bus connection to the rest of the cluster.
pub struct AppState {
    node_id: String,
    config: AppConfig,
    registry: TeamRegistry,
    bus: RwLock<Option<Arc<dyn MessageBus>>>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned
    /// cheaply. The node id is freshly generated.
    pub fn new(config: AppConfig, store: Arc<dyn TeamStore>) -> SharedState {
        Self::with_node_id(Uuid::new_v4().simple().to_string(), config, store)
    }

    /// Construct with an explicit node id (used by tests and clustered
    /// deployments with stable identities).
    pub fn with_node_id(
        node_id: impl Into<String>,
        config: AppConfig,
        store: Arc<dyn TeamStore>,
    ) -> SharedState {
        let registry = TeamRegistry::new(store, config.lock_wait);
        Arc::new(Self {
            node_id: node_id.into(),
            config,
            registry,
            bus: RwLock::new(None),
        })
    }

    /// Identity of this node on the bus.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The team registry owning every local aggregate.
    pub fn registry(&self) -> &TeamRegistry {
        &self.registry
    }

    /// Obtain a handle to the current bus, if one is installed.
    pub async fn bus(&self) -> Option<Arc<dyn MessageBus>> {
        let guard = self.bus.read().await;
        guard.as_ref().cloned()
    }

    /// Install a bus implementation; the synchronizer registers it.
    pub async fn install_bus(&self, bus: Arc<dyn MessageBus>) {
        let mut guard = self.bus.write().await;
        *guard = Some(bus);
    }

    /// Remove the current bus, returning the node to standalone operation.
    pub async fn clear_bus(&self) {
        let mut guard = self.bus.write().await;
        guard.take();
    }
}
