//! Process-wide mapping from room name to room.
//!
//! The registry is an explicitly constructed instance handed to whatever
//! accepts connections — there is no global room map. Its lifetime is the
//! serving lifetime of the process, and `shutdown` tears everything down so
//! tests can build a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{DocEngine, EngineFactory};
use crate::persistence::{PersistenceGateway, ResourceStore};
use crate::ws::room::{spawn_room, RoomHandle};

/// Tunables for the connection-coordination engine.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// How long an empty room lingers before its cleanup runs.
    pub cleanup_grace: Duration,
    /// How often each session is probed for liveness.
    pub ping_interval: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            cleanup_grace: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Counters for the health endpoint and the periodic metrics log.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub rooms: usize,
    pub connections: usize,
    pub peak_connections: usize,
    pub uptime_seconds: u64,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    engine_factory: EngineFactory,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    resources: Option<Arc<dyn ResourceStore>>,
    options: RelayOptions,
    started_at: Instant,
    total_connections: AtomicUsize,
    peak_connections: AtomicUsize,
}

impl RoomRegistry {
    pub fn new(
        engine_factory: EngineFactory,
        gateway: Option<Arc<dyn PersistenceGateway>>,
        resources: Option<Arc<dyn ResourceStore>>,
        options: RelayOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            engine_factory,
            gateway,
            resources,
            options,
            started_at: Instant::now(),
            total_connections: AtomicUsize::new(0),
            peak_connections: AtomicUsize::new(0),
        })
    }

    /// Return the room for `name`, constructing and registering it first if
    /// needed. Construction happens under the map lock, so concurrent calls
    /// for the same fresh name observe exactly one room — and one
    /// persistence load.
    pub async fn get_or_create(self: &Arc<Self>, name: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(name) {
            if !handle.is_closed() {
                return handle.clone();
            }
            // A previous incarnation tore down without deregistering
            // (shutdown path); fall through and rebuild.
        }
        let handle = spawn_room(name.to_string(), self);
        rooms.insert(name.to_string(), handle.clone());
        info!("Created room '{}'", name);
        handle
    }

    /// Remove a room from the registry. Only a room's own completed
    /// cleanup path should call this; a destroy for a room that still has
    /// sessions is a usage error and is ignored with a warning.
    pub async fn destroy(&self, name: &str) {
        let mut rooms = self.rooms.lock().await;
        match rooms.get(name) {
            Some(handle) if handle.connections() > 0 => {
                warn!(
                    "Refusing to destroy room '{}' with {} active connections",
                    name,
                    handle.connections()
                );
            }
            Some(_) => {
                rooms.remove(name);
                info!("Removed room '{}' from registry", name);
            }
            None => debug!("Destroy for unknown room '{}' ignored", name),
        }
    }

    /// Drain every room (saving state opportunistically) and clear the map.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().await.values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
        self.rooms.lock().await.clear();
        info!("Registry shut down");
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.rooms.lock().await.len();
        RegistryStats {
            rooms,
            connections: self.total_connections.load(Ordering::SeqCst),
            peak_connections: self.peak_connections.load(Ordering::SeqCst),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub(crate) fn new_engine(&self) -> Box<dyn DocEngine> {
        (self.engine_factory)()
    }

    pub(crate) fn gateway(&self) -> Option<Arc<dyn PersistenceGateway>> {
        self.gateway.clone()
    }

    pub(crate) fn resource_store(&self) -> Option<Arc<dyn ResourceStore>> {
        self.resources.clone()
    }

    pub(crate) fn cleanup_grace(&self) -> Duration {
        self.options.cleanup_grace
    }

    pub fn ping_interval(&self) -> Duration {
        self.options.ping_interval
    }

    pub(crate) fn note_attach(&self) {
        let total = self.total_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_connections.fetch_max(total, Ordering::SeqCst);
    }

    pub(crate) fn note_detach(&self) {
        self.total_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
