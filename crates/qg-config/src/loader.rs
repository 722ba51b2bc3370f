//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "queuegate.toml",
    "./config/config.toml",
    "/etc/queuegate/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_env_overrides(&mut config, |key| env::var(key).ok());
        validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("QUEUEGATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `QUEUEGATE_*` overrides. Values that fail to parse are ignored and the
/// file/default value is kept.
fn apply_env_overrides<F>(config: &mut AppConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = var("QUEUEGATE_QUEUE_PROVIDER") {
        config.queue_provider = val;
    }
    if let Some(val) = var("QUEUEGATE_QUEUE_ROUTING") {
        // Unparseable JSON is kept as a string so routing_table() reports it
        // and falls back to the default.
        config.queue_routing =
            Some(serde_json::from_str(&val).unwrap_or(serde_json::Value::String(val)));
    }

    // Redis
    if let Some(val) = var("QUEUEGATE_REDIS_HOST") {
        config.redis.host = val;
    }
    if let Some(port) = var("QUEUEGATE_REDIS_PORT").and_then(|v| v.parse().ok()) {
        config.redis.port = port;
    }
    if let Some(val) = var("QUEUEGATE_REDIS_PREFIX") {
        config.redis.prefix = val;
    }

    // AMQP
    if let Some(val) = var("QUEUEGATE_AMQP_URL") {
        config.amqp.url = val;
    }
    if let Some(attempts) = var("QUEUEGATE_AMQP_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.amqp.retry_attempts = attempts;
    }
    if let Some(delay) = var("QUEUEGATE_AMQP_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
        config.amqp.retry_delay_ms = delay;
    }

    if let Some(val) = var("QUEUEGATE_NOTIFICATIONS_ENABLED") {
        config.notifications.enabled = val.parse().unwrap_or(true);
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.amqp.retry_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "amqp.retry_attempts must be at least 1".to_string(),
        ));
    }
    if config.redis.prefix.is_empty() {
        return Err(ConfigError::ValidationError(
            "redis.prefix must not be empty".to_string(),
        ));
    }
    Ok(())
}
