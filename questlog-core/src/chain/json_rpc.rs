//! Ethereum JSON-RPC over HTTP.

use crate::chain::transport::{BlockHeader, ChainTransport, TransportError};
use crate::events::RawLog;
use async_trait::async_trait;
use ethers_core::types::{Address, Block, H256, Log, U64};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Chain transport backed by a node's HTTP JSON-RPC endpoint.
pub struct JsonRpcTransport {
    endpoint: Url,
    http_client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl JsonRpcTransport {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a transport for the given endpoint.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            http_client: reqwest::Client::builder()
                .timeout(Self::REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Issue one JSON-RPC call.
    ///
    /// A `null` result decodes to `None`, which callers use for "not found".
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    async fn request_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, TransportError> {
        self.request(method, params)
            .await?
            .ok_or_else(|| TransportError::Decode(format!("{method} returned null")))
    }
}

#[async_trait]
impl ChainTransport for JsonRpcTransport {
    async fn handshake(&self) -> Result<u64, TransportError> {
        let chain_id: U64 = self
            .request_required("eth_chainId", serde_json::json!([]))
            .await?;
        debug!(endpoint = %self.endpoint, chain_id = chain_id.as_u64(), "Node handshake ok");
        Ok(chain_id.as_u64())
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        let number: U64 = self
            .request_required("eth_blockNumber", serde_json::json!([]))
            .await?;
        Ok(number.as_u64())
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>, TransportError> {
        let block: Option<Block<H256>> = self
            .request(
                "eth_getBlockByNumber",
                serde_json::json!([U64::from(number), false]),
            )
            .await?;
        let Some(block) = block else {
            return Ok(None);
        };
        // Pending blocks have no hash yet
        let Some(hash) = block.hash else {
            return Ok(None);
        };
        Ok(Some(BlockHeader {
            number,
            hash,
            parent_hash: block.parent_hash,
        }))
    }

    async fn block_logs(
        &self,
        contract: Address,
        block_hash: H256,
    ) -> Result<Vec<RawLog>, TransportError> {
        // EIP-234 filter, pinned to one block by hash
        let filter = serde_json::json!([{
            "address": contract,
            "blockHash": block_hash,
        }]);
        let logs: Vec<Log> = self.request("eth_getLogs", filter).await?.unwrap_or_default();

        let mut raw_logs = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            match raw_log_from(log) {
                Some(raw) => raw_logs.push(raw),
                None => warn!(block_hash = ?block_hash, "Skipping log without topics or block"),
            }
        }
        raw_logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(raw_logs)
    }
}

fn raw_log_from(log: Log) -> Option<RawLog> {
    let mut topics = log.topics.into_iter();
    let selector = topics.next()?;
    let block_hash = log.block_hash?;
    let block_number = log.block_number?.as_u64();
    let log_index = log.log_index.map(|index| index.low_u64()).unwrap_or_default();
    Some(RawLog {
        selector,
        indexed_args: topics.collect(),
        data: log.data.to_vec(),
        block_hash,
        block_number,
        log_index,
    })
}
