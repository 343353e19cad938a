use crate::entities::Character;
use crate::events::{DomainEvent, EventPayload};
use crate::handlers::HandlerError;
use crate::persistence::PersistenceService;
use kanau::processor::Processor;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies character events (created, updated, deleted, level-up, transfer).
pub struct CharacterHandler {
    store: Arc<dyn PersistenceService>,
}

impl CharacterHandler {
    pub fn new(store: Arc<dyn PersistenceService>) -> Self {
        Self { store }
    }

    async fn existing(&self, token_id: i64) -> Result<Character, HandlerError> {
        self.store
            .get_character(token_id)
            .await?
            .ok_or(HandlerError::NotFound {
                entity: "character",
                id: token_id,
            })
    }

    pub async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let token_id = event.entity_id;
        match &event.payload {
            EventPayload::EntityCreated {
                class,
                stats,
                equipment,
            } => {
                let owner = event.owner.as_deref().ok_or(HandlerError::MissingData {
                    kind: event.kind(),
                    field: "owner",
                })?;
                let mut character = Character::new(
                    token_id,
                    owner.to_owned(),
                    class.clone(),
                    *stats,
                    equipment.clone(),
                    event.timestamp,
                );
                // A repeated creation keeps what was recorded before it
                if let Some(existing) = self.store.get_character(token_id).await? {
                    let created = std::mem::replace(&mut character.history, existing.history);
                    for entry in created {
                        character.record(&entry.action, entry.timestamp, entry.details);
                    }
                }
                self.store.upsert_character(&character).await?;
                info!(token_id, owner, class = %character.class, "Character created");
            }
            EventPayload::EntityUpdated { stats, equipment } => {
                let mut character = self.existing(token_id).await?;
                character.stats = *stats;
                character.equipment = equipment.clone();
                character.record(
                    "updated",
                    event.timestamp,
                    json!({ "stats": stats, "equipment": equipment }),
                );
                self.store.upsert_character(&character).await?;
                debug!(token_id, "Character updated");
            }
            EventPayload::EntityDeleted => {
                if self.store.delete_character(token_id).await? {
                    info!(token_id, "Character deleted");
                } else {
                    debug!(token_id, "Character already absent");
                }
            }
            EventPayload::LevelUp { level, stats } => {
                let mut character = self.existing(token_id).await?;
                character.level = *level;
                character.stats = *stats;
                character.record(
                    "level_up",
                    event.timestamp,
                    json!({ "level": level, "stats": stats }),
                );
                self.store.upsert_character(&character).await?;
                info!(token_id, level, "Character leveled up");
            }
            EventPayload::Transfer => {
                let new_owner = event.new_owner.as_deref().ok_or(HandlerError::MissingData {
                    kind: event.kind(),
                    field: "newOwner",
                })?;
                let mut character = self.existing(token_id).await?;
                let from = event.owner.clone().unwrap_or_else(|| character.owner.clone());
                character.owner = new_owner.to_owned();
                character.record(
                    "transfer",
                    event.timestamp,
                    json!({ "from": from, "to": new_owner }),
                );
                self.store.upsert_character(&character).await?;
                info!(token_id, from = %from, to = new_owner, "Character transferred");
            }
            _ => {}
        }
        Ok(())
    }
}

impl Processor<DomainEvent> for CharacterHandler {
    type Output = ();
    type Error = HandlerError;
    #[tracing::instrument(skip_all, err, name = "Handler:Character", fields(event = %event))]
    async fn process(&self, event: DomainEvent) -> Result<(), HandlerError> {
        self.handle(&event).await
    }
}
