//! TOML file configuration structures.
//!
//! These structs directly map to the `questlog.toml` file format. Durations
//! are given in milliseconds.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Chain node and watcher section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint of the node.
    pub rpc_url: Url,
    /// Address of the character/quest contract, 0x-prefixed hex.
    pub contract_address: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// First block to ingest. Defaults to the head at start-up.
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_retained_blocks")]
    pub retained_blocks: usize,
    #[serde(default = "default_max_blocks_per_poll")]
    pub max_blocks_per_poll: u64,
    /// Resolve reorgs automatically by walking back to the fork point.
    #[serde(default = "default_true")]
    pub auto_reprocess_reorgs: bool,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_retained_blocks() -> usize {
    128
}

fn default_max_blocks_per_poll() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

/// Retry queue section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delivery attempts per event, the first one included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

/// Database section. The URL itself comes from `DATABASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_attempts: default_connect_attempts(),
            connect_delay_ms: default_connect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_delay_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:3000"

[chain]
rpc_url = "http://localhost:8545"
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
poll_interval_ms = 1000
start_block = 42
max_reconnect_attempts = 3
reconnect_delay_ms = 250
retained_blocks = 64
max_blocks_per_poll = 10
auto_reprocess_reorgs = false

[queue]
max_retries = 7
retry_base_delay_ms = 100

[store]
max_connections = 4
connect_attempts = 2
connect_delay_ms = 50
connect_timeout_ms = 750
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.chain.rpc_url.as_str(), "http://localhost:8545/");
        assert_eq!(config.chain.start_block, Some(42));
        assert!(!config.chain.auto_reprocess_reorgs);
        assert_eq!(config.queue.max_retries, 7);
        assert_eq!(config.store.connect_delay_ms, 50);
        assert_eq!(config.store.connect_timeout_ms, 750);
    }

    #[test]
    fn test_defaults_apply_to_missing_sections() {
        let toml_str = r#"
[chain]
rpc_url = "http://localhost:8545"
contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, default_listen_addr());
        assert_eq!(config.chain.poll_interval_ms, 2_000);
        assert_eq!(config.chain.start_block, None);
        assert!(config.chain.auto_reprocess_reorgs);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.store.connect_attempts, 5);
        assert_eq!(config.store.connect_timeout_ms, 5_000);
    }

    #[test]
    fn test_chain_section_is_required() {
        let result: Result<FileConfig, _> = toml::from_str("[server]\nlisten = \"127.0.0.1:3000\"\n");
        assert!(result.is_err());
    }
}
