//! Runtime configuration for the ingestion core.
//!
//! These types hold validated values supplied at process start. Loading and
//! parsing the config file is handled by the server crate.

use ethers_core::types::Address;
use std::time::Duration;

/// Chain watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Contract whose logs are ingested.
    pub contract_address: Address,
    /// Delay between polls for new blocks.
    pub poll_interval: Duration,
    /// First block to process. `None` starts at the head seen on connect.
    pub start_block: Option<u64>,
    /// Reconnect attempts before the watcher gives up.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Number of recent block hashes kept for parent-hash checks.
    pub retained_blocks: usize,
    /// Upper bound of blocks processed in one poll while catching up.
    pub max_blocks_per_poll: u64,
}

impl WatcherConfig {
    pub fn new(contract_address: Address) -> Self {
        Self {
            contract_address,
            poll_interval: Duration::from_secs(2),
            start_block: None,
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            retained_blocks: 128,
            max_blocks_per_poll: 100,
        }
    }
}

/// Ordered retry queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delivery attempts per event, including the first one.
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubled for every further one.
    pub retry_base_delay: Duration,
    /// Start draining as soon as an event is pushed.
    pub auto_drain: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay: Duration::from_millis(500),
            auto_drain: true,
        }
    }
}

/// Durable store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Connection attempts before the store is declared unavailable.
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts.
    pub connect_delay: Duration,
    /// How long a single attempt may wait for a connection.
    pub connect_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: String) -> Self {
        Self {
            database_url,
            max_connections: 10,
            connect_attempts: 5,
            connect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
