//! Configuration for meshgate.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHGATE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshgate/config.toml
//!   3. ~/.config/meshgate/config.toml
//!
//! Every field has a default except `broker.url` and `storage.database_path`,
//! which are required — `load()` fails with `ConfigError::Missing` if either
//! is absent from both the file and the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshgateConfig {
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL, e.g. `mqtt://mqtt.example.org:1883`. Required.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic pattern subscribed to on connect.
    pub topic_pattern: String,
    pub use_tls: bool,
    pub client_id: String,
    pub reconnect_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path. Required.
    pub database_path: PathBuf,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_queue_capacity: usize,
    pub dedupe_window_ms: u64,
    pub rate_limit_max_per_window: u32,
    pub rate_limit_window_ms: u64,
    pub batch_max_size: usize,
    pub batch_max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub broadcaster_heartbeat_ms: u64,
    pub broadcaster_snapshot_max_nodes: usize,
    pub broadcaster_snapshot_max_events: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeshgateConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            topic_pattern: "msh/US/#".to_string(),
            use_tls: false,
            client_id: "meshgate".to_string(),
            reconnect_period_ms: 5_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            retention_days: 30,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_queue_capacity: 10_000,
            dedupe_window_ms: 60_000,
            rate_limit_max_per_window: 1,
            rate_limit_window_ms: 1_000,
            batch_max_size: 100,
            batch_max_wait_ms: 500,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            broadcaster_heartbeat_ms: 30_000,
            broadcaster_snapshot_max_nodes: 500,
            broadcaster_snapshot_max_events: 200,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshgate")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("required setting missing: {0}")]
    Missing(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshgateConfig {
    /// Load config: file → env overrides → required-field check.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeshgateConfig::default()
        };
        config.apply_env_overrides();
        config.check_required()?;
        Ok(config)
    }

    fn check_required(&self) -> Result<(), ConfigError> {
        if self.broker.url.is_empty() {
            return Err(ConfigError::Missing("broker url (MESHGATE_BROKER_URL)"));
        }
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database path (MESHGATE_DATABASE_PATH)"));
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeshgateConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MESHGATE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MESHGATE_BROKER_URL") {
            self.broker.url = v;
        }
        if let Ok(v) = std::env::var("MESHGATE_BROKER_USERNAME") {
            self.broker.username = Some(v);
        }
        if let Ok(v) = std::env::var("MESHGATE_BROKER_PASSWORD") {
            self.broker.password = Some(v);
        }
        if let Ok(v) = std::env::var("MESHGATE_TOPIC_PATTERN") {
            self.broker.topic_pattern = v;
        }
        if let Ok(v) = std::env::var("MESHGATE_BROKER_USE_TLS") {
            self.broker.use_tls = is_truthy(&v);
        }
        if let Ok(v) = std::env::var("MESHGATE_CLIENT_ID") {
            self.broker.client_id = v;
        }
        if let Ok(v) = std::env::var("MESHGATE_RECONNECT_PERIOD_MS") {
            if let Ok(p) = v.parse() {
                self.broker.reconnect_period_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MESHGATE_RETENTION_DAYS") {
            if let Ok(p) = v.parse() {
                self.storage.retention_days = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_MAX_QUEUE_CAPACITY") {
            if let Ok(p) = v.parse() {
                self.ingest.max_queue_capacity = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_DEDUPE_WINDOW_MS") {
            if let Ok(p) = v.parse() {
                self.ingest.dedupe_window_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_RATE_LIMIT_MAX_PER_WINDOW") {
            if let Ok(p) = v.parse() {
                self.ingest.rate_limit_max_per_window = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_RATE_LIMIT_WINDOW_MS") {
            if let Ok(p) = v.parse() {
                self.ingest.rate_limit_window_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_BATCH_MAX_SIZE") {
            if let Ok(p) = v.parse() {
                self.ingest.batch_max_size = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_BATCH_MAX_WAIT_MS") {
            if let Ok(p) = v.parse() {
                self.ingest.batch_max_wait_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_API_PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_BROADCASTER_HEARTBEAT_MS") {
            if let Ok(p) = v.parse() {
                self.api.broadcaster_heartbeat_ms = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_BROADCASTER_SNAPSHOT_MAX_NODES") {
            if let Ok(p) = v.parse() {
                self.api.broadcaster_snapshot_max_nodes = p;
            }
        }
        if let Ok(v) = std::env::var("MESHGATE_BROADCASTER_SNAPSHOT_MAX_EVENTS") {
            if let Ok(p) = v.parse() {
                self.api.broadcaster_snapshot_max_events = p;
            }
        }
    }
}

fn is_truthy(v: &str) -> bool {
    v == "true" || v == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_shape() {
        let config = MeshgateConfig::default();
        assert_eq!(config.broker.topic_pattern, "msh/US/#");
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.ingest.batch_max_size, 100);
    }

    #[test]
    fn load_fails_without_required_fields() {
        let config = MeshgateConfig::default();
        assert!(matches!(config.check_required(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn check_required_passes_once_set() {
        let mut config = MeshgateConfig::default();
        config.broker.url = "mqtt://localhost:1883".to_string();
        config.storage.database_path = PathBuf::from("/tmp/meshgate.db");
        assert!(config.check_required().is_ok());
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir()
            .join(format!("meshgate-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("MESHGATE_CONFIG", config_path.to_str().unwrap());
        }

        let path = MeshgateConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        unsafe {
            std::env::set_var("MESHGATE_BROKER_URL", "mqtt://localhost:1883");
            std::env::set_var("MESHGATE_DATABASE_PATH", "/tmp/meshgate-test.db");
        }
        let config = MeshgateConfig::load().expect("load should succeed");
        assert_eq!(config.storage.retention_days, 30);

        unsafe {
            std::env::remove_var("MESHGATE_CONFIG");
            std::env::remove_var("MESHGATE_BROKER_URL");
            std::env::remove_var("MESHGATE_DATABASE_PATH");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn is_truthy_accepts_true_and_one() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }
}
