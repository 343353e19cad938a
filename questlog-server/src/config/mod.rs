//! Configuration module for questlog-server.
//!
//! Handles loading configuration from the TOML file, CLI arguments and
//! environment variables, and turns it into the core's config types.

pub mod file;

use crate::config::file::FileConfig;
use ethers_core::types::Address;
use questlog_core::config::{QueueConfig, StoreConfig, WatcherConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Chain side of the loaded configuration.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub rpc_url: Url,
    pub watcher: WatcherConfig,
    pub auto_reprocess_reorgs: bool,
}

/// Store settings minus the URL, which is read from the environment.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_connections: u32,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub connect_timeout: Duration,
}

impl StoreSettings {
    pub fn with_url(&self, database_url: String) -> StoreConfig {
        StoreConfig {
            database_url,
            max_connections: self.max_connections,
            connect_attempts: self.connect_attempts,
            connect_delay: self.connect_delay,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub chain: ChainSettings,
    pub queue: QueueConfig,
    pub store: StoreSettings,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Read the TOML file, apply CLI overrides and validate.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.load_str(&config_content)
    }

    fn load_str(&self, content: &str) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        let contract_address = self.validate(&file_config)?;
        Ok(build_loaded_config(file_config, contract_address))
    }

    fn validate(&self, config: &FileConfig) -> Result<Address, ConfigError> {
        let contract_address: Address = config.chain.contract_address.parse().map_err(|e| {
            ConfigError::ValidationError(format!(
                "invalid contract address {}: {e}",
                config.chain.contract_address
            ))
        })?;
        if contract_address.is_zero() {
            return Err(ConfigError::ValidationError(
                "contract address must not be the zero address".into(),
            ));
        }
        if !matches!(config.chain.rpc_url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "rpc_url must be http or https, got {}",
                config.chain.rpc_url.scheme()
            )));
        }
        if config.chain.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if config.chain.retained_blocks == 0 || config.chain.max_blocks_per_poll == 0 {
            return Err(ConfigError::ValidationError(
                "retained_blocks and max_blocks_per_poll must be positive".into(),
            ));
        }
        if config.queue.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_retries must be at least 1".into(),
            ));
        }
        if config.store.connect_attempts == 0 || config.store.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connect_attempts and max_connections must be positive".into(),
            ));
        }
        if config.store.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be positive".into(),
            ));
        }
        Ok(contract_address)
    }
}

fn build_loaded_config(file_config: FileConfig, contract_address: Address) -> LoadedConfig {
    let chain = file_config.chain;
    let watcher = WatcherConfig {
        contract_address,
        poll_interval: Duration::from_millis(chain.poll_interval_ms),
        start_block: chain.start_block,
        max_reconnect_attempts: chain.max_reconnect_attempts,
        reconnect_delay: Duration::from_millis(chain.reconnect_delay_ms),
        retained_blocks: chain.retained_blocks,
        max_blocks_per_poll: chain.max_blocks_per_poll,
    };

    LoadedConfig {
        listen: file_config.server.listen,
        chain: ChainSettings {
            rpc_url: chain.rpc_url,
            watcher,
            auto_reprocess_reorgs: chain.auto_reprocess_reorgs,
        },
        queue: QueueConfig {
            max_retries: file_config.queue.max_retries,
            retry_base_delay: Duration::from_millis(file_config.queue.retry_base_delay_ms),
            auto_drain: true,
        },
        store: StoreSettings {
            max_connections: file_config.store.max_connections,
            connect_attempts: file_config.store.connect_attempts,
            connect_delay: Duration::from_millis(file_config.store.connect_delay_ms),
            connect_timeout: Duration::from_millis(file_config.store.connect_timeout_ms),
        },
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
