use std::sync::Arc;

use axum::{routing::get, Router};

use crate::handlers::health_check;
use crate::ws::registry::RoomRegistry;

/// Create API routes
pub fn create_api_routes(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(registry)
}
