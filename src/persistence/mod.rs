//! Boundary to durable storage and external resource cleanup.
//!
//! The relay calls `load` once when a room is first constructed and `save`
//! once when a drained room is cleaned up (plus opportunistically on
//! shutdown). Resource release is best-effort: a failed delete is logged by
//! the caller and never blocks room teardown.

pub mod postgres;

use futures_util::future::BoxFuture;

pub use postgres::PgGateway;

#[derive(Debug)]
pub enum PersistenceError {
    Database(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for PersistenceError {}

#[derive(Debug)]
pub enum ResourceError {
    Release(String),
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::Release(e) => write!(f, "resource release failed: {}", e),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Durable storage for serialized room state.
pub trait PersistenceGateway: Send + Sync {
    /// Load prior state for a room. `None` means no prior state; corrupt
    /// state is also surfaced as `None` by implementations that can tell.
    fn load(&self, room: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, PersistenceError>>;

    /// Persist the room's serialized state. Last writer wins.
    fn save(&self, room: &str, state: Vec<u8>) -> BoxFuture<'_, Result<(), PersistenceError>>;
}

/// Deletion of externally stored artifacts referenced by a document.
pub trait ResourceStore: Send + Sync {
    /// Attempt to delete the given keys. Partial failure is reported as an
    /// error; the caller logs it and moves on.
    fn release(&self, keys: Vec<String>) -> BoxFuture<'_, Result<(), ResourceError>>;
}
