use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::ws::registry::RelayOptions;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origin for the frontend
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL; without it the relay runs in-memory only
    pub db_url: Option<String>,

    /// Upload service API base URL
    #[serde(default = "default_uploads_api_url")]
    pub uploads_api_url: String,

    /// Upload service API token; without it uploaded files are never
    /// deleted during room cleanup
    pub uploads_api_token: Option<String>,

    /// Seconds between liveness probes on each connection
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Seconds an empty room lingers before its deferred cleanup runs
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Relay tunables derived from this configuration
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            cleanup_grace: Duration::from_secs(self.cleanup_grace_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            cors_origins: None,
            log_level: default_log_level(),
            db_url: None,
            uploads_api_url: default_uploads_api_url(),
            uploads_api_token: None,
            ping_interval_secs: default_ping_interval_secs(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_uploads_api_url() -> String {
    "https://api.uploadthing.com".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_cleanup_grace_secs() -> u64 {
    3600
}
