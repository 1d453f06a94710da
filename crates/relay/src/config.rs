//! Server configuration.
//!
//! Layered as defaults, then the TOML file, then `RELAY__SECTION__KEY`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::queue::{JsonCodec, MemoryQueueFactory, QueueFactory, RedisQueueFactory};
use crate::store::StoreConfig;

pub const APP_NAME: &str = "relay";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Idle time before an SSE stream sends a `ping` frame.
    pub heartbeat_interval_ms: u64,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8123,
            heartbeat_interval_ms: 1500,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file. Relative to the data directory when not absolute.
    pub sqlite_path: String,
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: "relay.db".to_string(),
            postgres_url: None,
            max_connections: 5,
        }
    }
}

impl StorageConfig {
    /// Resolve the store backend, placing relative SQLite paths under `data_dir`.
    pub fn store_config(&self, data_dir: &Path) -> Result<StoreConfig> {
        match self.backend {
            StorageBackend::Memory => Ok(StoreConfig::Memory),
            StorageBackend::Sqlite => {
                let path = expand_str_path(&self.sqlite_path)?;
                let path = if path.is_absolute() {
                    path
                } else {
                    data_dir.join(path)
                };
                Ok(StoreConfig::Sqlite {
                    path,
                    max_connections: self.max_connections,
                })
            }
            StorageBackend::Postgres => {
                let url = self
                    .postgres_url
                    .clone()
                    .ok_or_else(|| anyhow!("storage.postgres_url is required for postgres"))?;
                Ok(StoreConfig::Postgres {
                    url,
                    max_connections: self.max_connections,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: Option<String>,
    /// Keep in-memory messages encoded as JSON.
    pub encode_messages: bool,
    /// Grace period before a finished queue is removed.
    pub removal_delay_ms: u64,
    pub reap_interval_ms: u64,
    /// Expiry of Redis keys belonging to a run.
    pub key_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redis_url: None,
            encode_messages: false,
            removal_delay_ms: 500,
            reap_interval_ms: 1000,
            key_ttl_secs: 3600,
        }
    }
}

impl QueueConfig {
    pub fn removal_delay(&self) -> Duration {
        Duration::from_millis(self.removal_delay_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    /// Build the factory for the configured queue backend.
    pub async fn factory(&self) -> Result<Arc<dyn QueueFactory>> {
        match self.backend {
            QueueBackend::Memory if self.encode_messages => {
                Ok(Arc::new(MemoryQueueFactory::encoded(Arc::new(JsonCodec))))
            }
            QueueBackend::Memory => Ok(Arc::new(MemoryQueueFactory::new())),
            QueueBackend::Redis => {
                let url = self
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("queue.redis_url is required for redis"))?;
                let factory =
                    RedisQueueFactory::connect(url, Duration::from_secs(self.key_ttl_secs))
                        .await
                        .context("connecting to redis")?;
                Ok(Arc::new(factory))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

/// Read the layered configuration, writing a default file first if none exists.
pub fn load_or_init_config(config_file: &Path, dry_run: bool) -> Result<AppConfig> {
    if !config_file.exists() {
        if dry_run {
            log::info!(
                "dry-run: would create default config at {}",
                config_file.display()
            );
        } else {
            write_default_config(config_file)?;
        }
    }
    load_config(config_file)
}

/// Read the layered configuration without touching the disk.
pub fn load_config(config_file: &Path) -> Result<AppConfig> {
    let defaults = AppConfig::default();
    let built = Config::builder()
        .set_default("logging.level", defaults.logging.level)?
        .set_default("server.host", defaults.server.host)?
        .set_default("server.port", i64::from(defaults.server.port))?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        )
        .build()?;

    Ok(built.try_deserialize()?)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push_str("\n# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__SECTION__KEY\n\n");
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init_config(&path, false).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.queue.backend, QueueBackend::Memory);

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for relay"));
        assert!(body.contains("[storage]"));
    }

    #[test]
    fn dry_run_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = load_or_init_config(&path, true).unwrap();
        assert!(!path.exists());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 9000\n\n[storage]\nbackend = \"sqlite\"\nsqlite_path = \"runs.db\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.heartbeat_interval_ms, 1500);

        let store = config.storage.store_config(dir.path()).unwrap();
        match store {
            StoreConfig::Sqlite { path, .. } => assert_eq!(path, dir.path().join("runs.db")),
            other => panic!("unexpected store config: {other:?}"),
        }
    }

    #[test]
    fn postgres_requires_url() {
        let storage = StorageConfig {
            backend: StorageBackend::Postgres,
            ..StorageConfig::default()
        };
        assert!(storage.store_config(Path::new("/tmp")).is_err());
    }

    #[tokio::test]
    async fn redis_requires_url() {
        let queue = QueueConfig {
            backend: QueueBackend::Redis,
            ..QueueConfig::default()
        };
        assert!(queue.factory().await.is_err());
    }

    #[test]
    fn env_prefix_is_upper_case() {
        assert_eq!(env_prefix(), "RELAY");
    }
}
