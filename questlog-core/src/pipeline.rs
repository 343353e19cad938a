//! Wiring between watcher, queue and handlers.
//!
//! ```text
//! ChainWatcher --on_event--> RetryQueue --on_process--> CharacterHandler --> PersistenceService
//!                                       \-on_process--> QuestHandler     -/
//! ```

use crate::chain::{ChainTransport, ChainWatcher};
use crate::config::QueueConfig;
use crate::handlers::{CharacterHandler, QuestHandler};
use crate::persistence::PersistenceService;
use crate::queue::RetryQueue;
use crate::utils::ListenerId;
use kanau::processor::Processor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone)]
pub struct Pipeline {
    queue: RetryQueue,
    failed_events: Arc<AtomicU64>,
}

impl Pipeline {
    /// Build a queue with both aggregate handlers registered on it.
    pub fn new(config: QueueConfig, store: Arc<dyn PersistenceService>) -> Self {
        let queue = RetryQueue::new(config);

        let character = Arc::new(CharacterHandler::new(store.clone()));
        queue.on_process(move |event| {
            let handler = character.clone();
            async move { handler.process(event).await }
        });
        let quest = Arc::new(QuestHandler::new(store));
        queue.on_process(move |event| {
            let handler = quest.clone();
            async move { handler.process(event).await }
        });

        // The queue logs the payload itself; keep a count for the health probe
        let failed_events = Arc::new(AtomicU64::new(0));
        let counter = failed_events.clone();
        queue.on_error(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        Self {
            queue,
            failed_events,
        }
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Events dropped after a terminal delivery failure since start.
    pub fn failed_events(&self) -> u64 {
        self.failed_events.load(Ordering::Relaxed)
    }

    /// Feed every event the watcher emits into the queue.
    pub fn attach<T: ChainTransport>(&self, watcher: &mut ChainWatcher<T>) -> ListenerId {
        let queue = self.queue.clone();
        watcher.on_event(move |event| queue.push(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeChain;
    use crate::config::WatcherConfig;
    use crate::entities::{Reward, Stats};
    use crate::events::normalizer::tests::character_created_log;
    use crate::events::{DomainEvent, EventPayload};
    use crate::persistence::MemoryPersistence;
    use ethers_core::types::Address;
    use std::time::Duration;

    fn pipeline(auto_drain: bool) -> (Pipeline, Arc<MemoryPersistence>) {
        let store = Arc::new(MemoryPersistence::new());
        let config = QueueConfig {
            max_retries: 2,
            retry_base_delay: Duration::ZERO,
            auto_drain,
        };
        (Pipeline::new(config, store.clone()), store)
    }

    fn stats(strength: u16) -> Stats {
        Stats::from_array([strength, 8, 9, 7, 6, 5])
    }

    fn created(timestamp: i64) -> DomainEvent {
        DomainEvent::new(
            1,
            timestamp,
            EventPayload::EntityCreated {
                class: "warrior".into(),
                stats: stats(10),
                equipment: vec![],
            },
        )
        .with_owner("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
    }

    fn level_up(timestamp: i64) -> DomainEvent {
        DomainEvent::new(
            1,
            timestamp,
            EventPayload::LevelUp {
                level: 2,
                stats: stats(12),
            },
        )
    }

    #[tokio::test]
    async fn test_create_then_level_up() {
        let (pipeline, store) = pipeline(false);
        pipeline.queue().push(created(1000));
        pipeline.queue().push(level_up(2000));
        pipeline.queue().process().await;

        let character = store.get_character(1).await.unwrap().unwrap();
        assert_eq!(character.stats.strength, 12);
        assert_eq!(character.history.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_push_is_applied_in_timestamp_order() {
        let (pipeline, store) = pipeline(false);
        pipeline.queue().push(level_up(2000));
        pipeline.queue().push(created(1000));
        let report = pipeline.queue().process().await;

        assert_eq!(report.failed, 0);
        assert_eq!(store.get_character(1).await.unwrap().unwrap().level, 2);
    }

    #[tokio::test]
    async fn test_duplicate_quest_join() {
        let (pipeline, store) = pipeline(false);
        let queue = pipeline.queue();
        queue.push(DomainEvent::new(
            1,
            1000,
            EventPayload::QuestCreated {
                name: "X".into(),
                rewards: vec![Reward::new("XP", 100)],
            },
        ));
        let joined = DomainEvent::new(1, 1100, EventPayload::QuestJoined { character_id: 5 });
        queue.push(joined.clone());
        queue.push(joined);
        queue.process().await;

        let quest = store.get_quest(1).await.unwrap().unwrap();
        assert_eq!(quest.participants.len(), 1);
        assert_eq!(quest.rewards, vec![Reward::new("XP", 100)]);
    }

    #[tokio::test]
    async fn test_terminal_failures_are_counted() {
        let (pipeline, store) = pipeline(false);
        let mut orphan = created(1000);
        orphan.owner = None;
        pipeline.queue().push(orphan);
        pipeline.queue().push(level_up(2000));

        let report = pipeline.queue().process().await;
        assert_eq!(report.failed, 2);
        assert_eq!(pipeline.failed_events(), 2);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_chain_logs_end_up_in_store() {
        let chain = Arc::new(FakeChain::new());
        chain.push_block(vec![character_created_log(7, 10)]);
        chain.push_block(vec![character_created_log(8, 14)]);

        let (pipeline, store) = pipeline(true);
        let mut watcher = ChainWatcher::new(
            chain,
            WatcherConfig {
                start_block: Some(0),
                ..WatcherConfig::new(Address::repeat_byte(0x11))
            },
        );
        pipeline.attach(&mut watcher);

        watcher.connect().await.unwrap();
        assert_eq!(watcher.poll().await.unwrap(), 2);
        tokio::time::timeout(Duration::from_secs(5), pipeline.queue().wait_idle())
            .await
            .unwrap();

        let owned = store
            .characters_by_owner("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap();
        let strengths: Vec<(i64, u16)> = owned.iter().map(|c| (c.token_id, c.stats.strength)).collect();
        assert_eq!(strengths, vec![(7, 10), (8, 14)]);
        assert_eq!(pipeline.failed_events(), 0);
    }
}
