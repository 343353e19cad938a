use crate::entities::Quest;
use crate::events::{DomainEvent, EventPayload};
use crate::handlers::HandlerError;
use crate::persistence::PersistenceService;
use kanau::processor::Processor;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies quest events. Each one maps onto a single idempotent store call.
pub struct QuestHandler {
    store: Arc<dyn PersistenceService>,
}

impl QuestHandler {
    pub fn new(store: Arc<dyn PersistenceService>) -> Self {
        Self { store }
    }

    pub async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let quest_id = event.entity_id;
        let at = event.timestamp;
        match &event.payload {
            EventPayload::QuestCreated { name, rewards } => {
                let quest = Quest::new(quest_id, name.clone(), rewards.clone(), at);
                if self.store.create_quest(&quest).await? {
                    info!(quest_id, name = %name, "Quest created");
                } else {
                    debug!(quest_id, "Quest already exists");
                }
            }
            EventPayload::QuestJoined { character_id } => {
                if self
                    .store
                    .add_quest_participant(quest_id, *character_id, at)
                    .await?
                {
                    info!(quest_id, character_id, "Character joined quest");
                }
            }
            EventPayload::QuestProgress { progress } => {
                self.store
                    .update_quest_progress(quest_id, *progress, at)
                    .await?;
                debug!(quest_id, progress, "Quest progress updated");
            }
            EventPayload::QuestCompleted { character_ids } => {
                self.store
                    .complete_quest(quest_id, character_ids, at)
                    .await?;
                info!(quest_id, completed = character_ids.len(), "Quest completed");
            }
            EventPayload::QuestRewardsDistributed { rewards } => {
                self.store
                    .distribute_rewards(quest_id, rewards.clone(), at)
                    .await?;
                info!(quest_id, rewards = rewards.len(), "Quest rewards distributed");
            }
            _ => {}
        }
        Ok(())
    }
}

impl Processor<DomainEvent> for QuestHandler {
    type Output = ();
    type Error = HandlerError;
    #[tracing::instrument(skip_all, err, name = "Handler:Quest", fields(event = %event))]
    async fn process(&self, event: DomainEvent) -> Result<(), HandlerError> {
        self.handle(&event).await
    }
}
