//! Chain watcher.
//!
//! The watcher follows the chain block by block. Each block's parent hash is
//! checked against the hash retained for the block below it; a mismatch is a
//! reorg, which halts the watcher at that height until a
//! [`WatcherCommand`] resumes it. Logs of every accepted block are normalized
//! and handed to the event listeners in chain order.
//!
//! Connection handling is an explicit state machine published on a
//! `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (error) Reconnecting -> Connecting ...
//!                                                   \-> Closed (attempts exhausted)
//! ```

use crate::chain::{ChainTransport, TransportError};
use crate::config::WatcherConfig;
use crate::events::{DomainEvent, normalize};
use crate::utils::{ListenerId, Registry};
use ethers_core::types::H256;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Errors that can occur in the chain watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    /// Handshake with the node failed
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),

    /// Request to the node failed while connected
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Gave up reconnecting
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Polled before a successful connect
    #[error("watcher is not connected")]
    NotConnected,

    /// The watcher was disconnected and cannot be used again
    #[error("watcher is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests accepted by a running watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherCommand {
    /// Forget retained hashes at or above the block and continue from there.
    ResumeFrom(u64),
    /// Find the fork point of the current reorg and continue after it.
    Reprocess,
    /// Tear down listeners and stop for good.
    Disconnect,
}

/// Sending side of the watcher command channel.
///
/// Sends never block, so the handle can be used from inside a synchronous
/// reorg listener.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    tx: mpsc::Sender<WatcherCommand>,
}

impl WatcherHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WatcherCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn resume_from(&self, block: u64) -> bool {
        self.send(WatcherCommand::ResumeFrom(block))
    }

    pub fn reprocess(&self) -> bool {
        self.send(WatcherCommand::Reprocess)
    }

    pub fn disconnect(&self) -> bool {
        self.send(WatcherCommand::Disconnect)
    }

    fn send(&self, command: WatcherCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(?command, error = %e, "Dropping watcher command");
                false
            }
        }
    }
}

pub type BlockListener = Arc<dyn Fn(u64) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(DomainEvent) + Send + Sync>;

enum BlockOutcome {
    Accepted,
    NotYetAvailable,
    /// The node served logs that do not belong to the checked header.
    LogsMismatch,
    Reorg,
}

pub struct ChainWatcher<T: ChainTransport> {
    transport: Arc<T>,
    config: WatcherConfig,
    block_listeners: Registry<BlockListener>,
    reorg_listeners: Registry<BlockListener>,
    event_listeners: Registry<EventListener>,
    /// Hashes of recently accepted blocks, bounded by `retained_blocks`.
    retained: BTreeMap<u64, H256>,
    next_block: Option<u64>,
    halted_at: Option<u64>,
    reconnect_attempts: u32,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: ChainTransport> ChainWatcher<T> {
    pub fn new(transport: Arc<T>, config: WatcherConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            block_listeners: Registry::new(),
            reorg_listeners: Registry::new(),
            event_listeners: Registry::new(),
            retained: BTreeMap::new(),
            next_block: None,
            halted_at: None,
            reconnect_attempts: 0,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Next block the watcher will look at.
    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    /// Height of the unresolved reorg, if any.
    pub fn halted_at(&self) -> Option<u64> {
        self.halted_at
    }

    pub fn on_block<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.block_listeners.add(Arc::new(listener))
    }

    pub fn on_reorg<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.reorg_listeners.add(Arc::new(listener))
    }

    pub fn on_event<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(DomainEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(Arc::new(listener))
    }

    pub fn remove_block_listener(&mut self, id: ListenerId) -> bool {
        self.block_listeners.remove(id)
    }

    pub fn remove_reorg_listener(&mut self, id: ListenerId) -> bool {
        self.reorg_listeners.remove(id)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.event_listeners.remove(id)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "Watcher state changed");
            *current = next;
            true
        });
    }

    /// Handshake with the node and position the watcher.
    ///
    /// The first successful connect starts at `start_block`, or at the current
    /// head when none is configured. Later connects keep the position.
    pub async fn connect(&mut self) -> Result<u64, WatcherError> {
        if self.state() == ConnectionState::Closed {
            return Err(WatcherError::Closed);
        }
        self.set_state(ConnectionState::Connecting);
        let chain_id = match self.transport.handshake().await {
            Ok(chain_id) => chain_id,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(WatcherError::Connection(e));
            }
        };
        self.reconnect_attempts = 0;

        if self.next_block.is_none() {
            let start = match self.config.start_block {
                Some(block) => block,
                None => match self.transport.block_number().await {
                    Ok(head) => head,
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(WatcherError::Connection(e));
                    }
                },
            };
            self.next_block = Some(start);
        }

        self.set_state(ConnectionState::Connected);
        info!(chain_id, next_block = ?self.next_block, "Connected to chain node");
        Ok(chain_id)
    }

    /// Process new blocks up to the head, at most `max_blocks_per_poll` of them.
    ///
    /// Returns the number of blocks accepted. Does nothing while halted on a
    /// reorg.
    pub async fn poll(&mut self) -> Result<u64, WatcherError> {
        if self.state() == ConnectionState::Closed {
            return Err(WatcherError::Closed);
        }
        if let Some(block) = self.halted_at {
            debug!(block, "Watcher halted on reorg, waiting for reprocessing");
            return Ok(0);
        }
        let Some(mut next) = self.next_block else {
            return Err(WatcherError::NotConnected);
        };

        let head = self.transport.block_number().await?;
        let budget = self.config.max_blocks_per_poll.max(1);
        let last = head.min(next.saturating_add(budget - 1));

        let mut accepted = 0;
        while next <= last {
            match self.process_block(next).await? {
                BlockOutcome::Accepted => {
                    accepted += 1;
                    next += 1;
                }
                BlockOutcome::NotYetAvailable
                | BlockOutcome::LogsMismatch
                | BlockOutcome::Reorg => break,
            }
        }
        Ok(accepted)
    }

    async fn process_block(&mut self, number: u64) -> Result<BlockOutcome, WatcherError> {
        let Some(header) = self.transport.block_header(number).await? else {
            return Ok(BlockOutcome::NotYetAvailable);
        };

        let expected_parent = number
            .checked_sub(1)
            .and_then(|parent| self.retained.get(&parent).copied());
        if let Some(expected) = expected_parent
            && expected != header.parent_hash
        {
            warn!(
                block = number,
                expected_parent = ?expected,
                parent_hash = ?header.parent_hash,
                "Chain reorganization detected"
            );
            self.halted_at = Some(number);
            for listener in self.reorg_listeners.iter() {
                listener(number);
            }
            return Ok(BlockOutcome::Reorg);
        }

        // Fetch before retaining so a failed request retries the whole block
        let logs = self
            .transport
            .block_logs(self.config.contract_address, header.hash)
            .await?;
        if let Some(stray) = logs
            .iter()
            .find(|log| log.block_hash != header.hash || log.block_number != number)
        {
            warn!(
                block = number,
                hash = ?header.hash,
                log_block = stray.block_number,
                log_block_hash = ?stray.block_hash,
                "Node served logs of another block, retrying on next poll"
            );
            return Ok(BlockOutcome::LogsMismatch);
        }
        self.retain(number, header.hash);

        let captured_at = time::OffsetDateTime::now_utc().unix_timestamp();
        for log in &logs {
            match normalize(log, captured_at) {
                Ok(Some(event)) => {
                    for listener in self.event_listeners.iter() {
                        listener(event.clone());
                    }
                }
                Ok(None) => {
                    debug!(block = log.block_number, log_index = log.log_index, "Skipping log");
                }
                Err(e) if e.is_unknown_selector() => {
                    warn!(
                        block = log.block_number,
                        log_index = log.log_index,
                        error = %e,
                        "Dropping log with unrecognized selector"
                    );
                }
                Err(e) => {
                    error!(
                        block = log.block_number,
                        log_index = log.log_index,
                        error = %e,
                        "Dropping malformed contract log"
                    );
                }
            }
        }

        for listener in self.block_listeners.iter() {
            listener(number);
        }
        self.next_block = Some(number + 1);
        Ok(BlockOutcome::Accepted)
    }

    fn retain(&mut self, number: u64, hash: H256) {
        self.retained.insert(number, hash);
        while self.retained.len() > self.config.retained_blocks.max(1) {
            self.retained.pop_first();
        }
    }

    /// Drop retained hashes at or above `block` and continue from there.
    pub fn resume_from(&mut self, block: u64) {
        self.retained.split_off(&block);
        self.halted_at = None;
        self.next_block = Some(block);
        info!(block, "Resuming block processing");
    }

    /// Resolve the current reorg by resuming right after the fork point.
    pub async fn reprocess(&mut self) -> Result<(), WatcherError> {
        let Some(halted) = self.halted_at else {
            debug!("Reprocess requested without a pending reorg");
            return Ok(());
        };
        let resume = match self.find_fork_point(halted).await? {
            Some(fork) => {
                info!(halted, fork, "Found fork point");
                fork + 1
            }
            None => {
                let oldest = self.retained.first_key_value().map_or(halted, |(n, _)| *n);
                error!(
                    halted,
                    resume = oldest,
                    retained = self.retained.len(),
                    "Reorg is deeper than the retained window"
                );
                oldest
            }
        };
        self.resume_from(resume);
        Ok(())
    }

    /// Highest retained block below `halted` that is still canonical.
    async fn find_fork_point(&self, halted: u64) -> Result<Option<u64>, WatcherError> {
        for (&number, &hash) in self.retained.range(..halted).rev() {
            let canonical = self.transport.block_header(number).await?;
            if canonical.is_some_and(|header| header.hash == hash) {
                return Ok(Some(number));
            }
        }
        Ok(None)
    }

    /// Remove every listener and close the watcher for good.
    pub fn disconnect(&mut self) {
        self.block_listeners.clear();
        self.reorg_listeners.clear();
        self.event_listeners.clear();
        self.set_state(ConnectionState::Closed);
        info!("Chain watcher disconnected");
    }

    /// Reconnect with a fixed delay until a handshake succeeds.
    ///
    /// Returns `Ok(false)` if shutdown was signalled while waiting.
    async fn reconnect(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<bool, WatcherError> {
        loop {
            if self.reconnect_attempts >= self.config.max_reconnect_attempts {
                let attempts = self.reconnect_attempts;
                error!(attempts, "Reconnect attempts exhausted, giving up on chain node");
                self.set_state(ConnectionState::Closed);
                return Err(WatcherError::ReconnectExhausted { attempts });
            }
            self.reconnect_attempts += 1;
            self.set_state(ConnectionState::Reconnecting);
            warn!(
                attempt = self.reconnect_attempts,
                max_attempts = self.config.max_reconnect_attempts,
                delay = ?self.config.reconnect_delay,
                "Reconnecting to chain node"
            );

            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        return Ok(false);
                    }
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            match self.connect().await {
                Ok(_) => return Ok(true),
                Err(e) => warn!(error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn handle_command(&mut self, command: WatcherCommand) -> Result<(), WatcherError> {
        match command {
            WatcherCommand::ResumeFrom(block) => self.resume_from(block),
            WatcherCommand::Reprocess => self.reprocess().await?,
            WatcherCommand::Disconnect => self.disconnect(),
        }
        Ok(())
    }

    /// Run the watcher until shutdown, disconnect or reconnect exhaustion.
    pub async fn run(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut command_rx: mpsc::Receiver<WatcherCommand>,
    ) -> Result<(), WatcherError> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        if let Err(e) = self.connect().await {
            warn!(error = %e, "Initial connection to chain node failed");
            if !self.reconnect(&mut shutdown_rx).await? {
                info!("Chain watcher shutdown complete");
                return Ok(());
            }
        }

        loop {
            let result = tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Chain watcher received shutdown signal");
                        break;
                    }
                    continue;
                }
                Some(command) = command_rx.recv() => {
                    debug!(?command, "Watcher command received");
                    self.handle_command(command).await
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll().await.map(|_| ())
                }
            };

            if self.state() == ConnectionState::Closed {
                break;
            }
            if let Err(e) = result {
                warn!(error = %e, "Chain request failed, connection lost");
                self.set_state(ConnectionState::Disconnected);
                if !self.reconnect(&mut shutdown_rx).await? {
                    break;
                }
            }
        }

        info!("Chain watcher shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::events::normalizer::tests::{character_created_log, raw_log, uint_topic};
    use crate::events::{ContractEvent, EventKind};
    use ethers_core::types::Address;
    use crate::events::RawLog;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::ZERO,
            start_block: Some(0),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::ZERO,
            ..WatcherConfig::new(Address::repeat_byte(0x11))
        }
    }

    fn chain_with_blocks(count: usize) -> Arc<FakeChain> {
        let chain = Arc::new(FakeChain::new());
        for _ in 0..count {
            chain.push_block(vec![]);
        }
        chain
    }

    fn record_blocks(
        watcher: &mut ChainWatcher<FakeChain>,
    ) -> (Arc<Mutex<Vec<u64>>>, Arc<Mutex<Vec<u64>>>) {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let reorgs = Arc::new(Mutex::new(Vec::new()));
        let sink = blocks.clone();
        watcher.on_block(move |n| sink.lock().unwrap().push(n));
        let sink = reorgs.clone();
        watcher.on_reorg(move |n| sink.lock().unwrap().push(n));
        (blocks, reorgs)
    }

    #[tokio::test]
    async fn test_connect_positions_at_head_without_start_block() {
        let chain = chain_with_blocks(5);
        let mut watcher = ChainWatcher::new(
            chain,
            WatcherConfig {
                start_block: None,
                ..config()
            },
        );
        assert_eq!(watcher.connect().await.unwrap(), 31337);
        assert_eq!(watcher.next_block(), Some(4));
        assert_eq!(watcher.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let chain = chain_with_blocks(1);
        chain.fail_handshakes(1);
        let mut watcher = ChainWatcher::new(chain, config());
        let err = watcher.connect().await.unwrap_err();
        assert!(matches!(err, WatcherError::Connection(_)));
        assert_eq!(watcher.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_poll_emits_events_and_block_numbers_in_order() {
        let chain = Arc::new(FakeChain::new());
        chain.push_block(vec![]);
        chain.push_block(vec![
            character_created_log(7, 10),
            raw_log(ContractEvent::CharacterBurned, vec![uint_topic(3)], &[]),
        ]);

        let mut watcher = ChainWatcher::new(chain, config());
        let (blocks, reorgs) = record_blocks(&mut watcher);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        watcher.on_event(move |event| sink.lock().unwrap().push(event));

        watcher.connect().await.unwrap();
        assert_eq!(watcher.poll().await.unwrap(), 2);

        assert_eq!(*blocks.lock().unwrap(), vec![0, 1]);
        assert!(reorgs.lock().unwrap().is_empty());
        let events = events.lock().unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::EntityCreated, EventKind::EntityDeleted]);
        assert_eq!(events[0].entity_id, 7);
        assert_eq!(watcher.next_block(), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_selector_is_dropped() {
        let chain = Arc::new(FakeChain::new());
        let mut unknown = character_created_log(1, 10);
        unknown.selector = H256::repeat_byte(0x42);
        chain.push_block(vec![unknown, character_created_log(2, 10)]);

        let mut watcher = ChainWatcher::new(chain, config());
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = ids.clone();
        watcher.on_event(move |event| sink.lock().unwrap().push(event.entity_id));

        watcher.connect().await.unwrap();
        watcher.poll().await.unwrap();
        assert_eq!(*ids.lock().unwrap(), vec![2]);
    }

    /// Serves canonical headers but, while `stale` is set, logs of the
    /// sibling block at the same height.
    struct StaleLogs {
        canonical: Arc<FakeChain>,
        sibling: Arc<FakeChain>,
        stale: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChainTransport for StaleLogs {
        async fn handshake(&self) -> Result<u64, TransportError> {
            self.canonical.handshake().await
        }

        async fn block_number(&self) -> Result<u64, TransportError> {
            self.canonical.block_number().await
        }

        async fn block_header(
            &self,
            number: u64,
        ) -> Result<Option<crate::chain::BlockHeader>, TransportError> {
            self.canonical.block_header(number).await
        }

        async fn block_logs(
            &self,
            contract: Address,
            block_hash: H256,
        ) -> Result<Vec<RawLog>, TransportError> {
            if self.stale.load(AtomicOrdering::SeqCst)
                && let Some(number) = self.canonical.number_of(block_hash)
                && let Some(sibling_hash) = self.sibling.hash_of(number)
            {
                return self.sibling.block_logs(contract, sibling_hash).await;
            }
            self.canonical.block_logs(contract, block_hash).await
        }
    }

    #[tokio::test]
    async fn test_logs_of_another_block_are_not_emitted() {
        let canonical = Arc::new(FakeChain::new());
        canonical.push_block(vec![]);
        canonical.push_block(vec![character_created_log(8, 10)]);
        canonical.push_block(vec![]);

        // Same heights on a different branch
        let sibling = Arc::new(FakeChain::new());
        sibling.push_block(vec![]);
        sibling.fork_from(0);
        sibling.push_block(vec![character_created_log(7, 10)]);
        assert_ne!(sibling.hash_of(1), canonical.hash_of(1));

        let transport = Arc::new(StaleLogs {
            canonical: canonical.clone(),
            sibling,
            stale: AtomicBool::new(true),
        });
        let mut watcher = ChainWatcher::new(transport.clone(), config());
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = ids.clone();
        watcher.on_event(move |event| sink.lock().unwrap().push(event.entity_id));
        let reorgs = Arc::new(Mutex::new(Vec::new()));
        let sink = reorgs.clone();
        watcher.on_reorg(move |n| sink.lock().unwrap().push(n));

        watcher.connect().await.unwrap();
        assert_eq!(watcher.poll().await.unwrap(), 1);
        assert!(ids.lock().unwrap().is_empty());
        assert_eq!(watcher.next_block(), Some(1));
        // Still stale: block 1 is retried, never accepted
        assert_eq!(watcher.poll().await.unwrap(), 0);
        assert_eq!(watcher.next_block(), Some(1));

        transport.stale.store(false, AtomicOrdering::SeqCst);
        assert_eq!(watcher.poll().await.unwrap(), 2);
        assert_eq!(*ids.lock().unwrap(), vec![8]);
        assert!(reorgs.lock().unwrap().is_empty());
        assert_eq!(watcher.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_poll_respects_block_budget() {
        let chain = chain_with_blocks(10);
        let mut watcher = ChainWatcher::new(
            chain,
            WatcherConfig {
                max_blocks_per_poll: 4,
                ..config()
            },
        );
        watcher.connect().await.unwrap();
        assert_eq!(watcher.poll().await.unwrap(), 4);
        assert_eq!(watcher.poll().await.unwrap(), 4);
        assert_eq!(watcher.poll().await.unwrap(), 2);
        assert_eq!(watcher.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reorg_halts_and_reprocess_resumes_at_fork_point() {
        let chain = chain_with_blocks(4);
        let mut watcher = ChainWatcher::new(chain.clone(), config());
        let (blocks, reorgs) = record_blocks(&mut watcher);

        watcher.connect().await.unwrap();
        watcher.poll().await.unwrap();
        assert_eq!(*blocks.lock().unwrap(), vec![0, 1, 2, 3]);

        // Blocks 2 and 3 are replaced, then block 4 lands on the new branch
        chain.fork_from(2);
        chain.push_block(vec![]);

        assert_eq!(watcher.poll().await.unwrap(), 0);
        assert_eq!(*reorgs.lock().unwrap(), vec![4]);
        assert_eq!(*blocks.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(watcher.halted_at(), Some(4));

        // Still halted: no further block or reorg notifications
        assert_eq!(watcher.poll().await.unwrap(), 0);
        assert_eq!(reorgs.lock().unwrap().len(), 1);

        watcher.reprocess().await.unwrap();
        assert_eq!(watcher.halted_at(), None);
        assert_eq!(watcher.next_block(), Some(2));

        assert_eq!(watcher.poll().await.unwrap(), 3);
        assert_eq!(*blocks.lock().unwrap(), vec![0, 1, 2, 3, 2, 3, 4]);
        assert_eq!(watcher.retained.get(&3).copied(), chain.hash_of(3));
    }

    #[tokio::test]
    async fn test_reorg_deeper_than_window_resumes_at_oldest_retained() {
        let chain = chain_with_blocks(6);
        let mut watcher = ChainWatcher::new(
            chain.clone(),
            WatcherConfig {
                retained_blocks: 2,
                ..config()
            },
        );
        watcher.connect().await.unwrap();
        watcher.poll().await.unwrap();

        chain.fork_from(1);
        chain.push_block(vec![]);
        watcher.poll().await.unwrap();
        assert_eq!(watcher.halted_at(), Some(6));

        watcher.reprocess().await.unwrap();
        assert_eq!(watcher.next_block(), Some(4));
    }

    #[tokio::test]
    async fn test_resume_from_drops_hashes_above() {
        let chain = chain_with_blocks(3);
        let mut watcher = ChainWatcher::new(chain, config());
        watcher.connect().await.unwrap();
        watcher.poll().await.unwrap();

        watcher.resume_from(1);
        assert_eq!(watcher.retained.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(watcher.poll().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion() {
        let chain = chain_with_blocks(1);
        chain.fail_handshakes(u32::MAX);
        let watcher = ChainWatcher::new(chain.clone(), config());
        let state_rx = watcher.subscribe_state();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, command_rx) = WatcherHandle::channel(4);

        let err = watcher.run(shutdown_rx, command_rx).await.unwrap_err();
        assert!(matches!(err, WatcherError::ReconnectExhausted { attempts: 3 }));
        // Initial handshake plus one per reconnect attempt
        assert_eq!(chain.handshake_count(), 4);
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_successful_handshake_resets_reconnect_counter() {
        let chain = chain_with_blocks(1);
        chain.fail_handshakes(2);
        let mut watcher = ChainWatcher::new(chain.clone(), config());
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        assert!(watcher.connect().await.is_err());
        assert!(watcher.reconnect(&mut shutdown_rx).await.unwrap());
        assert_eq!(watcher.reconnect_attempts, 0);
        assert_eq!(watcher.state(), ConnectionState::Connected);

        // A later outage gets the full budget again
        chain.fail_handshakes(2);
        assert!(watcher.reconnect(&mut shutdown_rx).await.unwrap());
        assert_eq!(chain.handshake_count(), 6);
    }

    #[tokio::test]
    async fn test_run_recovers_from_request_failure() {
        let chain = Arc::new(FakeChain::new());
        chain.push_block(vec![character_created_log(1, 10)]);
        chain.fail_requests(1);

        let mut watcher = ChainWatcher::new(chain.clone(), config());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        watcher.on_event(move |event| {
            let _ = event_tx.send(event);
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_handle, command_rx) = WatcherHandle::channel(4);
        let task = tokio::spawn(watcher.run(shutdown_rx, command_rx));

        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.entity_id, 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(chain.handshake_count() >= 2);
    }

    #[tokio::test]
    async fn test_disconnect_command_closes_watcher() {
        let chain = chain_with_blocks(1);
        let mut watcher = ChainWatcher::new(chain, config());
        watcher.on_block(|_| {});
        watcher.on_event(|_| {});
        let state_rx = watcher.subscribe_state();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, command_rx) = WatcherHandle::channel(4);

        assert!(handle.disconnect());
        tokio::time::timeout(Duration::from_secs(5), watcher.run(shutdown_rx, command_rx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_clears_listeners() {
        let chain = chain_with_blocks(2);
        let mut watcher = ChainWatcher::new(chain, config());
        let (blocks, _) = record_blocks(&mut watcher);
        watcher.connect().await.unwrap();

        watcher.disconnect();
        assert_eq!(watcher.state(), ConnectionState::Closed);
        assert!(matches!(watcher.poll().await, Err(WatcherError::Closed)));
        assert!(matches!(watcher.connect().await, Err(WatcherError::Closed)));
        assert!(blocks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let chain = chain_with_blocks(0);
        let mut watcher = ChainWatcher::new(chain, config());
        let id = watcher.on_block(|_| {});
        assert!(watcher.remove_block_listener(id));
        assert!(!watcher.remove_block_listener(id));
        assert!(watcher.block_listeners.is_empty());
    }
}
