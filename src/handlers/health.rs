use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::{extract::State, Json};
use sysinfo::System;
use tracing::{debug, info};

use crate::models::HealthResponse;
use crate::ws::registry::RoomRegistry;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Plain-text liveness endpoint
pub async fn index() -> &'static str {
    "Collaboration relay is running"
}

/// Health and metrics endpoint
pub async fn health_check(State(registry): State<Arc<RoomRegistry>>) -> Json<HealthResponse> {
    debug!("Health check requested");
    let stats = registry.stats().await;
    let (cpu_usage, memory_used, memory_free, memory_total) = system_gauges();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: stats.uptime_seconds,
        rooms: stats.rooms,
        connections: stats.connections,
        peak_connections: stats.peak_connections,
        cpu_usage,
        memory_used,
        memory_total,
        memory_free,
    })
}

fn system_gauges() -> (f32, u64, u64, u64) {
    let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
    match sys_lock.lock() {
        Ok(mut sys) => {
            sys.refresh_cpu();
            sys.refresh_memory();
            (
                sys.global_cpu_info().cpu_usage(),
                sys.used_memory(),
                sys.free_memory(),
                sys.total_memory(),
            )
        }
        Err(_) => (0.0, 0, 0, 0),
    }
}

/// Log a metrics line every 30 seconds, mirroring the health endpoint.
pub fn spawn_metrics_logger(registry: Arc<RoomRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await; // the first tick completes immediately
        loop {
            interval.tick().await;
            let stats = registry.stats().await;
            let (cpu_usage, memory_used, _memory_free, memory_total) = system_gauges();
            info!(
                "CPU: {:.1}% | Mem: {}/{} MB | Rooms: {} | Conns: {} | Peak: {} | Up: {}s",
                cpu_usage,
                memory_used / 1024 / 1024,
                memory_total / 1024 / 1024,
                stats.rooms,
                stats.connections,
                stats.peak_connections,
                stats.uptime_seconds
            );
        }
    })
}
