use serde::{Deserialize, Serialize};

/// API response for the health and metrics endpoint
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub rooms: usize,
    pub connections: usize,
    pub peak_connections: usize,
    pub cpu_usage: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
