use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, error};

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

    /// CORS allowed origins (comma separated)
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,

    /// JWT secret key
    pub cloud_auth_jwt_secret: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Base URL of the application service answering principal and permission lookups
    pub app_service_url: Option<String>,

    /// How long a disconnected participant is held before it is removed
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// How long an empty room waits before it is destroyed
    #[serde(default = "default_room_linger_secs")]
    pub room_linger_secs: u64,

    /// Number of history entries kept for resync before compaction
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,

    /// Messages buffered per connection before it is treated as failed
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Interval between checkpoints of a live room
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Upper bound on the checkpoint retry backoff
    #[serde(default = "default_checkpoint_max_backoff_secs")]
    pub checkpoint_max_backoff_secs: u64,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the configuration for the process. Later calls are ignored.
pub fn init_config(config: Config) -> &'static Config {
    CONFIG.get_or_init(|| config)
}

/// Get the process configuration, falling back to defaults if none was installed.
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(Config::default)
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
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Allowed CORS origins, trimmed, empty entries dropped
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn room_linger(&self) -> Duration {
        Duration::from_secs(self.room_linger_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn checkpoint_max_backoff(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_backoff_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_auth_jwt_secret: None,
            db_url: None,
            app_service_url: None,
            grace_period_secs: default_grace_period_secs(),
            room_linger_secs: default_room_linger_secs(),
            history_retention: default_history_retention(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_max_backoff_secs: default_checkpoint_max_backoff_secs(),
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
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-sync".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_room_linger_secs() -> u64 {
    5
}

fn default_history_retention() -> usize {
    500
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_checkpoint_max_backoff_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let config = Config::default();
        assert_eq!(config.grace_period(), Duration::from_secs(30));
        assert_eq!(config.history_retention, 500);
        assert_eq!(config.server_address(), "0.0.0.0:3000");
        assert!(config.is_development());
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = Config {
            cors_origins: Some("https://a.example, https://b.example,,".to_string()),
            ..Config::default()
        };
        assert_eq!(config.cors_origin_list(), vec!["https://a.example", "https://b.example"]);
    }
}
