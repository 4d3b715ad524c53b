//! The room: one collaboratively edited document and the sessions attached
//! to it.
//!
//! Each room runs as its own task and owns all of its state. Sessions talk
//! to it through a command channel, so updates and awareness changes are
//! serialized through a single room-local stream: handlers run to
//! completion before the next command is dispatched, and fan-out preserves
//! the order in which messages were produced. Nothing in here needs a lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::DocEngine;
use crate::persistence::{PersistenceGateway, ResourceStore};
use crate::ws::awareness::{decode_awareness, encode_awareness, AwarenessTable};
use crate::ws::cleanup::{CleanupScheduler, Lifecycle};
use crate::ws::protocol::{self, Frame, MSG_AWARENESS, MSG_SYNC};
use crate::ws::registry::RoomRegistry;

const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Outbound capacity per session. A client that stops draining its socket
/// fills this up and is treated as gone.
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

pub enum RoomCmd {
    Attach {
        conn_id: Uuid,
        outbound: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Result<(), AttachError>>,
    },
    Detach {
        conn_id: Uuid,
    },
    Inbound {
        conn_id: Uuid,
        frame: Bytes,
    },
    Loaded {
        state: Option<Vec<u8>>,
    },
    CleanupFired {
        generation: u64,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, PartialEq)]
pub enum AttachError {
    /// The room finished tearing down between lookup and attach; resolve a
    /// fresh handle through the registry and try again.
    RoomClosed,
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::RoomClosed => write!(f, "room is closed"),
        }
    }
}

impl std::error::Error for AttachError {}

/// Cheap clone handed out by the registry; the way everything outside the
/// room task talks to the room.
#[derive(Clone)]
pub struct RoomHandle {
    name: String,
    cmd_tx: mpsc::Sender<RoomCmd>,
    conn_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of sessions currently attached.
    pub fn connections(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Attach a session. `outbound` receives every frame addressed to it;
    /// the room closing that channel means the session was force-closed.
    pub async fn attach(
        &self,
        conn_id: Uuid,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<(), AttachError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCmd::Attach {
                conn_id,
                outbound,
                reply,
            })
            .await
            .map_err(|_| AttachError::RoomClosed)?;
        rx.await.map_err(|_| AttachError::RoomClosed)?
    }

    pub async fn detach(&self, conn_id: Uuid) {
        let _ = self.cmd_tx.send(RoomCmd::Detach { conn_id }).await;
    }

    /// Route one raw inbound message from a session into the room.
    pub async fn inbound(&self, conn_id: Uuid, frame: Bytes) -> Result<(), AttachError> {
        self.cmd_tx
            .send(RoomCmd::Inbound { conn_id, frame })
            .await
            .map_err(|_| AttachError::RoomClosed)
    }

    pub(crate) async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.cmd_tx.send(RoomCmd::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct SessionHandle {
    outbound: mpsc::Sender<Bytes>,
    /// Awareness client ids this session introduced; cleared on disconnect.
    controlled: HashSet<u64>,
}

struct Room {
    name: String,
    engine: Box<dyn DocEngine>,
    awareness: AwarenessTable,
    sessions: HashMap<Uuid, SessionHandle>,
    lifecycle: Lifecycle,
    scheduler: CleanupScheduler,
    conn_count: Arc<AtomicUsize>,
    cmd_tx: mpsc::Sender<RoomCmd>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    resources: Option<Arc<dyn ResourceStore>>,
    registry: Arc<RoomRegistry>,
}

/// Construct a room and start its task. Prior state is loaded
/// asynchronously; the room serves immediately and converges once the load
/// completes, since loading applies a CRDT update like any other.
pub(crate) fn spawn_room(name: String, registry: &Arc<RoomRegistry>) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(ROOM_CHANNEL_CAPACITY);
    let conn_count = Arc::new(AtomicUsize::new(0));

    let room = Room {
        name: name.clone(),
        engine: registry.new_engine(),
        awareness: AwarenessTable::new(),
        sessions: HashMap::new(),
        lifecycle: Lifecycle::Active,
        scheduler: CleanupScheduler::new(registry.cleanup_grace()),
        conn_count: conn_count.clone(),
        cmd_tx: cmd_tx.clone(),
        gateway: registry.gateway(),
        resources: registry.resource_store(),
        registry: registry.clone(),
    };

    if let Some(gateway) = registry.gateway() {
        let tx = cmd_tx.clone();
        let room_name = name.clone();
        tokio::spawn(async move {
            let state = match gateway.load(&room_name).await {
                Ok(state) => state,
                Err(e) => {
                    error!("Failed to load state for room '{}': {}", room_name, e);
                    None
                }
            };
            let _ = tx.send(RoomCmd::Loaded { state }).await;
        });
    }

    tokio::spawn(room.run(cmd_rx));

    RoomHandle {
        name,
        cmd_tx,
        conn_count,
    }
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCmd::Attach {
                    conn_id,
                    outbound,
                    reply,
                } => self.handle_attach(conn_id, outbound, reply),
                RoomCmd::Detach { conn_id } => self.handle_detach(conn_id),
                RoomCmd::Inbound { conn_id, frame } => self.handle_inbound(conn_id, &frame),
                RoomCmd::Loaded { state } => self.handle_loaded(state),
                RoomCmd::CleanupFired { generation } => {
                    self.handle_cleanup_fired(generation).await
                }
                RoomCmd::Shutdown { done } => {
                    self.handle_shutdown().await;
                    let _ = done.send(());
                }
            }
            if matches!(self.lifecycle, Lifecycle::Cleaned) {
                break;
            }
        }

        // Anything still queued raced against teardown; attachers get told
        // to re-resolve through the registry.
        rx.close();
        while let Some(cmd) = rx.recv().await {
            if let RoomCmd::Attach { reply, .. } = cmd {
                let _ = reply.send(Err(AttachError::RoomClosed));
            }
        }
        debug!("Room task for '{}' ended", self.name);
    }

    fn handle_attach(
        &mut self,
        conn_id: Uuid,
        outbound: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Result<(), AttachError>>,
    ) {
        if self.lifecycle.is_draining() {
            let previous = std::mem::replace(&mut self.lifecycle, Lifecycle::Active);
            if let Lifecycle::Draining(pending) = previous {
                info!(
                    "Session joined room '{}' during grace period, cancelling deferred cleanup",
                    self.name
                );
                pending.cancel();
            }
        }

        self.sessions.insert(
            conn_id,
            SessionHandle {
                outbound,
                controlled: HashSet::new(),
            },
        );
        self.conn_count.fetch_add(1, Ordering::SeqCst);
        self.registry.note_attach();
        let _ = reply.send(Ok(()));
        info!(
            "Session {} joined room '{}' ({} connected)",
            conn_id,
            self.name,
            self.sessions.len()
        );

        // Initial sync: ask the peer for the deltas we are missing, and give
        // it the current presence table if there is one.
        let request = self.engine.sync_request();
        self.send_to(conn_id, protocol::encode_frame(MSG_SYNC, &request));
        if !self.awareness.is_empty() {
            let full = encode_awareness(&self.awareness.full_state());
            self.send_to(conn_id, protocol::encode_frame(MSG_AWARENESS, &full));
        }
    }

    fn handle_detach(&mut self, conn_id: Uuid) {
        let Some(session) = self.sessions.remove(&conn_id) else {
            debug!(
                "Detach for session {} not attached to room '{}' ignored",
                conn_id, self.name
            );
            return;
        };
        self.conn_count.fetch_sub(1, Ordering::SeqCst);
        self.registry.note_detach();

        // Clear the presence this session controlled, attributed to no
        // origin: every remaining session receives the removal.
        let controlled: Vec<u64> = session.controlled.iter().copied().collect();
        let tombstones = self.awareness.remove_clients(&controlled);
        if !tombstones.is_empty() {
            let frame = protocol::encode_frame(MSG_AWARENESS, &encode_awareness(&tombstones));
            self.broadcast(frame, None);
        }

        info!(
            "Session {} left room '{}' ({} remaining)",
            conn_id,
            self.name,
            self.sessions.len()
        );

        if self.sessions.is_empty() {
            self.begin_drain();
        }
    }

    fn handle_inbound(&mut self, conn_id: Uuid, frame: &[u8]) {
        if !self.sessions.contains_key(&conn_id) {
            // Already force-closed; its tail of queued messages is dropped.
            return;
        }
        match protocol::decode_frame(frame) {
            Ok(Frame::Sync(payload)) => match self.engine.handle_sync(payload) {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply {
                        self.send_to(conn_id, protocol::encode_frame(MSG_SYNC, &reply));
                    }
                    if let Some(update) = outcome.update {
                        // Never echoed back to the sender: it already has
                        // this update.
                        self.broadcast(
                            protocol::encode_frame(MSG_SYNC, &update),
                            Some(conn_id),
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "Sync message from session {} in room '{}' rejected: {}",
                        conn_id, self.name, e
                    );
                    self.force_close(conn_id);
                }
            },
            Ok(Frame::Awareness(payload)) => match decode_awareness(payload) {
                Ok(entries) => {
                    let change = self.awareness.apply(entries);
                    if change.is_empty() {
                        return;
                    }
                    if let Some(session) = self.sessions.get_mut(&conn_id) {
                        for id in &change.added {
                            session.controlled.insert(*id);
                        }
                        for id in &change.removed {
                            session.controlled.remove(id);
                        }
                    }
                    // Only the changed entries go out, to everyone
                    // including the originator.
                    let frame =
                        protocol::encode_frame(MSG_AWARENESS, &encode_awareness(&change.changed));
                    self.broadcast(frame, None);
                }
                Err(e) => {
                    warn!(
                        "Awareness message from session {} in room '{}' rejected: {}",
                        conn_id, self.name, e
                    );
                    self.force_close(conn_id);
                }
            },
            Ok(Frame::Unknown(kind)) => {
                debug!(
                    "Ignoring message of unknown kind {} in room '{}'",
                    kind, self.name
                );
            }
            Err(e) => {
                warn!(
                    "Undecodable message from session {} in room '{}': {}",
                    conn_id, self.name, e
                );
                self.force_close(conn_id);
            }
        }
    }

    fn handle_loaded(&mut self, state: Option<Vec<u8>>) {
        let Some(blob) = state else {
            info!("No prior state for room '{}'", self.name);
            return;
        };
        match self.engine.apply_snapshot(&blob) {
            Ok(Some(update)) => {
                info!(
                    "Loaded prior state for room '{}' ({} bytes)",
                    self.name,
                    blob.len()
                );
                self.broadcast(protocol::encode_frame(MSG_SYNC, &update), None);
            }
            Ok(None) => debug!("Prior state for room '{}' was already known", self.name),
            Err(e) => {
                warn!(
                    "Corrupt stored state for room '{}', starting fresh: {}",
                    self.name, e
                );
            }
        }
    }

    /// The room just emptied: capture the resource keys it references
    /// (without touching the document) and arm the cleanup timer.
    fn begin_drain(&mut self) {
        let resource_keys = self.engine.resource_keys();
        let grace = self.scheduler.grace();
        let tx = self.cmd_tx.clone();
        let pending = self.scheduler.arm(resource_keys, |generation| async move {
            let _ = tx.send(RoomCmd::CleanupFired { generation }).await;
        });
        info!(
            "Room '{}' drained, cleanup in {}s unless a session rejoins",
            self.name,
            grace.as_secs()
        );
        self.lifecycle = Lifecycle::Draining(pending);
    }

    async fn handle_cleanup_fired(&mut self, generation: u64) {
        let pending = match std::mem::replace(&mut self.lifecycle, Lifecycle::Cleaned) {
            Lifecycle::Draining(pending) if pending.generation == generation => pending,
            other => {
                // The cancel won the race; a stale fire is a no-op.
                self.lifecycle = other;
                debug!("Stale cleanup timer for room '{}' ignored", self.name);
                return;
            }
        };

        // Re-read from the live document rather than trusting the capture:
        // a late load may have brought in references the grace period must
        // not delete.
        let keys = self.engine.resource_keys();
        if keys != pending.resource_keys {
            debug!(
                "Resource set for room '{}' changed during grace period ({} captured, {} live)",
                self.name,
                pending.resource_keys.len(),
                keys.len()
            );
        }

        if !keys.is_empty() {
            if let Some(store) = &self.resources {
                info!(
                    "Releasing {} uploaded files for room '{}'",
                    keys.len(),
                    self.name
                );
                if let Err(e) = store.release(keys).await {
                    // Best effort: a failed external delete must not pin
                    // the room in memory.
                    error!("Resource release for room '{}' failed: {}", self.name, e);
                }
            }
        }

        self.engine.clear_resources();
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save(&self.name, self.engine.snapshot()).await {
                error!("Final save for room '{}' failed: {}", self.name, e);
            }
        }

        self.registry.destroy(&self.name).await;
        info!("Cleaned up room '{}'", self.name);
    }

    async fn handle_shutdown(&mut self) {
        let previous = std::mem::replace(&mut self.lifecycle, Lifecycle::Cleaned);
        if let Lifecycle::Draining(pending) = previous {
            pending.cancel();
        }
        for _ in 0..self.sessions.len() {
            self.registry.note_detach();
        }
        self.conn_count.store(0, Ordering::SeqCst);
        self.sessions.clear();
        if let Some(gateway) = &self.gateway {
            if let Err(e) = gateway.save(&self.name, self.engine.snapshot()).await {
                error!("Shutdown save for room '{}' failed: {}", self.name, e);
            }
        }
        info!("Room '{}' shut down", self.name);
    }

    /// Send one frame to one session; a session that cannot take it is
    /// treated as gone.
    fn send_to(&mut self, conn_id: Uuid, frame: Vec<u8>) {
        let Some(session) = self.sessions.get(&conn_id) else {
            return;
        };
        if session.outbound.try_send(Bytes::from(frame)).is_err() {
            warn!(
                "Send to session {} in room '{}' failed, closing it",
                conn_id, self.name
            );
            self.force_close(conn_id);
        }
    }

    fn broadcast(&mut self, frame: Vec<u8>, exclude: Option<Uuid>) {
        let payload = Bytes::from(frame);
        let mut stalled = Vec::new();
        for (&id, session) in &self.sessions {
            if Some(id) == exclude {
                continue;
            }
            if session.outbound.try_send(payload.clone()).is_err() {
                stalled.push(id);
            }
        }
        for id in stalled {
            warn!(
                "Broadcast to session {} in room '{}' failed, closing it",
                id, self.name
            );
            self.force_close(id);
        }
    }

    /// Disconnect a session from the room side. Dropping its outbound
    /// sender ends its socket loop; the detach it sends on the way out is
    /// then a no-op.
    fn force_close(&mut self, conn_id: Uuid) {
        self.handle_detach(conn_id);
    }
}
