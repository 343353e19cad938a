//! In-process chain used by the watcher and pipeline tests.

use crate::chain::{BlockHeader, ChainTransport, TransportError};
use crate::events::RawLog;
use async_trait::async_trait;
use ethers_core::types::{Address, H256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    headers: BTreeMap<u64, BlockHeader>,
    /// Logs by block hash. Orphaned blocks stay queryable, as on a real node.
    logs: HashMap<H256, Vec<RawLog>>,
    fork: u64,
    failing_handshakes: u32,
    failing_requests: u32,
    handshakes: u32,
}

/// A chain whose blocks, forks and outages are scripted by the test.
#[derive(Default)]
pub(crate) struct FakeChain {
    state: Mutex<FakeState>,
}

fn block_hash(fork: u64, number: u64) -> H256 {
    H256::from_low_u64_be((fork << 32) | (number + 1))
}

impl FakeChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a block on top of the current head carrying `logs`.
    pub(crate) fn push_block(&self, logs: Vec<RawLog>) -> BlockHeader {
        let mut state = self.state();
        let number = state.headers.last_key_value().map_or(0, |(n, _)| n + 1);
        let parent_hash = number
            .checked_sub(1)
            .and_then(|parent| state.headers.get(&parent))
            .map_or(H256::zero(), |parent| parent.hash);
        let header = BlockHeader {
            number,
            hash: block_hash(state.fork, number),
            parent_hash,
        };
        let logs = logs
            .into_iter()
            .enumerate()
            .map(|(index, mut log)| {
                log.block_hash = header.hash;
                log.block_number = number;
                log.log_index = index as u64;
                log
            })
            .collect();
        state.headers.insert(number, header);
        state.logs.insert(header.hash, logs);
        header
    }

    /// Replace every block from `number` up with a competing branch of the
    /// same height and no logs.
    pub(crate) fn fork_from(&self, number: u64) {
        let height = {
            let mut state = self.state();
            state.fork += 1;
            let height = state.headers.len() as u64;
            state.headers.split_off(&number);
            height
        };
        for _ in number..height {
            self.push_block(vec![]);
        }
    }

    pub(crate) fn hash_of(&self, number: u64) -> Option<H256> {
        self.state().headers.get(&number).map(|header| header.hash)
    }

    /// Number of the canonical block with this hash.
    pub(crate) fn number_of(&self, hash: H256) -> Option<u64> {
        self.state()
            .headers
            .values()
            .find(|header| header.hash == hash)
            .map(|header| header.number)
    }

    /// Fail the next `count` handshakes.
    pub(crate) fn fail_handshakes(&self, count: u32) {
        self.state().failing_handshakes = count;
    }

    /// Fail the next `count` `block_number` calls.
    pub(crate) fn fail_requests(&self, count: u32) {
        self.state().failing_requests = count;
    }

    pub(crate) fn handshake_count(&self) -> u32 {
        self.state().handshakes
    }
}

#[async_trait]
impl ChainTransport for FakeChain {
    async fn handshake(&self) -> Result<u64, TransportError> {
        let mut state = self.state();
        state.handshakes += 1;
        if state.failing_handshakes > 0 {
            state.failing_handshakes -= 1;
            return Err(TransportError::Closed);
        }
        Ok(31337)
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        let mut state = self.state();
        if state.failing_requests > 0 {
            state.failing_requests -= 1;
            return Err(TransportError::Closed);
        }
        Ok(state.headers.last_key_value().map_or(0, |(n, _)| *n))
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>, TransportError> {
        Ok(self.state().headers.get(&number).copied())
    }

    async fn block_logs(
        &self,
        _contract: Address,
        block_hash: H256,
    ) -> Result<Vec<RawLog>, TransportError> {
        self.state()
            .logs
            .get(&block_hash)
            .cloned()
            .ok_or_else(|| TransportError::Rpc {
                code: -32000,
                message: format!("unknown block {block_hash:?}"),
            })
    }
}
