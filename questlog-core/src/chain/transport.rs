use crate::events::RawLog;
use async_trait::async_trait;
use ethers_core::types::{Address, H256};
use thiserror::Error;

/// Errors that can occur while talking to a node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request error
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),

    /// Connection was closed by the peer
    #[error("connection closed")]
    Closed,
}

/// Header fields the watcher needs to check chain linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// Connection to a chain node.
///
/// Implementations do no business logic; every error is treated by the
/// watcher as a connection failure.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    /// Check that the node is reachable. Returns the chain id.
    async fn handshake(&self) -> Result<u64, TransportError>;

    /// Number of the latest block.
    async fn block_number(&self) -> Result<u64, TransportError>;

    /// Header of block `number`, `None` if the node does not have it yet.
    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>, TransportError>;

    /// Logs emitted by `contract` in the block with hash `block_hash`, in
    /// log order.
    async fn block_logs(
        &self,
        contract: Address,
        block_hash: H256,
    ) -> Result<Vec<RawLog>, TransportError>;
}
