use std::panic;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gaiapad_relay::clients::UploadsClient;
use gaiapad_relay::config::Config;
use gaiapad_relay::engine::{EngineFactory, YDocEngine};
use gaiapad_relay::handlers::{index, spawn_metrics_logger};
use gaiapad_relay::persistence::{PersistenceGateway, PgGateway, ResourceStore};
use gaiapad_relay::routes::create_api_routes;
use gaiapad_relay::ws::handler::websocket_handler;
use gaiapad_relay::ws::registry::RoomRegistry;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "gaiapad_relay=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting relay server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Initialize database persistence if a URL is provided
    let gateway: Option<Arc<dyn PersistenceGateway>> = match &config.db_url {
        Some(db_url) => match PgGateway::connect(db_url).await {
            Ok(gateway) => {
                info!("Database persistence enabled");
                Some(Arc::new(gateway))
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Running without persistence (in-memory only)");
                None
            }
        },
        None => {
            warn!("No database URL configured - running without persistence (in-memory only)");
            None
        }
    };

    // Upload cleanup needs an API token for the upload service
    let resources: Option<Arc<dyn ResourceStore>> = match &config.uploads_api_token {
        Some(token) => Some(Arc::new(UploadsClient::new(
            config.uploads_api_url.clone(),
            token.clone(),
        ))),
        None => {
            warn!("No upload service token configured - uploaded files will not be cleaned up");
            None
        }
    };

    let engine_factory: EngineFactory = Arc::new(|| Box::new(YDocEngine::new()));
    let registry = RoomRegistry::new(engine_factory, gateway, resources, config.relay_options());

    spawn_metrics_logger(registry.clone());

    let cors = match &config.cors_origins {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new().allow_origin(value),
            Err(_) => {
                warn!("Invalid CORS origin '{}', allowing any origin", origin);
                CorsLayer::new().allow_origin(Any)
            }
        },
        None => CorsLayer::new().allow_origin(Any),
    };

    // Every non-API path is a room; the room name is the path without its
    // leading slash.
    let app = Router::new()
        .route("/", get(index))
        .route("/*room_name", get(websocket_handler))
        .with_state(registry.clone())
        .nest("/api", create_api_routes(registry.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("Relay server running on http://{}", config.server_address());

    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down server...");
                shutdown_registry.shutdown().await;
                info!("Shutdown complete");
            }
        })
        .await
        .expect("Server failed to start");
}
