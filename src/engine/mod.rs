//! Boundary to the CRDT merge engine.
//!
//! The relay never inspects document content. It owns one engine per room
//! and drives it through this trait: sync payloads go in, an optional reply
//! for the sender and an optional update for fan-out come out. The default
//! implementation is backed by `yrs`.

pub mod ydoc;

use std::sync::Arc;

pub use ydoc::YDocEngine;

/// The effect of handling one sync payload.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Payload to send back to the originating session only (a state
    /// request asked for the deltas it is missing).
    pub reply: Option<Vec<u8>>,
    /// Payload to fan out to every other session (an update was applied
    /// and changed the document).
    pub update: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum EngineError {
    /// The payload could not be decoded by the engine's own codec.
    Codec(String),
    /// The payload decoded but could not be applied.
    Apply(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Codec(e) => write!(f, "undecodable sync payload: {}", e),
            EngineError::Apply(e) => write!(f, "failed to apply update: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Opaque CRDT state handle owned by a room.
pub trait DocEngine: Send + 'static {
    /// Handle one sync payload: a state request, a state response or an
    /// incremental update (the engine's decoder tells them apart).
    fn handle_sync(&mut self, payload: &[u8]) -> Result<SyncOutcome, EngineError>;

    /// Build a sync request from the current state, so a newly attached
    /// peer can compute and send back only the deltas we are missing.
    fn sync_request(&self) -> Vec<u8>;

    /// Apply a previously persisted snapshot. Returns the fan-out payload
    /// when the snapshot brought in state the document did not have.
    fn apply_snapshot(&mut self, blob: &[u8]) -> Result<Option<Vec<u8>>, EngineError>;

    /// Serialize the full document state for persistence.
    fn snapshot(&self) -> Vec<u8>;

    /// Keys of externally stored resources the document references.
    fn resource_keys(&self) -> Vec<String>;

    /// Drop all resource references from the document.
    fn clear_resources(&mut self);
}

/// Constructor for per-room engines, injected into the registry.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn DocEngine> + Send + Sync>;
