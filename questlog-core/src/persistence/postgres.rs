//! PostgreSQL-backed persistence.
//!
//! Characters are written whole with `INSERT ... ON CONFLICT DO UPDATE`.
//! Quest mutations lock the quest row, apply the change in memory and write
//! it back inside one transaction, so concurrent writers to the same quest
//! are serialized by the database.

use crate::config::StoreConfig;
use crate::entities::character::{
    DeleteCharacter, GetCharacter, GetCharactersByOwner, UpsertCharacter,
};
use crate::entities::quest::{GetQuest, InsertQuest};
use crate::entities::{Character, InvariantError, Quest, Reward};
use crate::framework::DatabaseProcessor;
use crate::persistence::{PersistenceService, StoreError};
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, error, info, warn};

pub struct PgPersistence {
    db: DatabaseProcessor,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self {
            db: DatabaseProcessor::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Open the connection pool, retrying with a fixed delay.
    ///
    /// Fails with [`StoreError::Unavailable`] once `connect_attempts` attempts
    /// have failed.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.connect_timeout)
                .connect(&config.database_url)
                .await;
            match result {
                Ok(pool) => {
                    info!(attempt, "Database connection established");
                    return Ok(Self::new(pool));
                }
                Err(e) if attempt >= attempts => {
                    error!(attempts, error = %e, "Database unreachable, giving up");
                    return Err(StoreError::Unavailable {
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        attempts,
                        retry_in = ?config.connect_delay,
                        error = %e,
                        "Database connection failed"
                    );
                    tokio::time::sleep(config.connect_delay).await;
                }
            }
        }
    }

    /// Lock a quest, apply `mutate`, and write it back when it reports a change.
    async fn mutate_quest<F>(&self, quest_id: i64, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Quest) -> Result<bool, InvariantError> + Send,
    {
        let mut tx = self.db.begin().await?;
        let Some(mut quest) = Quest::lock_for_update(&mut tx, quest_id).await? else {
            return Err(StoreError::NotFound {
                entity: "quest",
                id: quest_id,
            });
        };
        let changed = mutate(&mut quest)?;
        if changed {
            quest.validate()?;
            Quest::save(&mut tx, &quest).await?;
        }
        tx.commit().await?;
        Ok(changed)
    }
}

#[async_trait]
impl PersistenceService for PgPersistence {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.db.pool).await?;
        Ok(())
    }

    async fn get_character(&self, token_id: i64) -> Result<Option<Character>, StoreError> {
        Ok(self.db.process(GetCharacter { token_id }).await?)
    }

    async fn characters_by_owner(&self, owner: &str) -> Result<Vec<Character>, StoreError> {
        let owner = owner.to_owned();
        Ok(self.db.process(GetCharactersByOwner { owner }).await?)
    }

    async fn upsert_character(&self, character: &Character) -> Result<(), StoreError> {
        character.validate()?;
        self.db
            .process(UpsertCharacter {
                character: character.clone(),
            })
            .await?;
        Ok(())
    }

    async fn delete_character(&self, token_id: i64) -> Result<bool, StoreError> {
        Ok(self.db.process(DeleteCharacter { token_id }).await?)
    }

    async fn get_quest(&self, quest_id: i64) -> Result<Option<Quest>, StoreError> {
        Ok(self.db.process(GetQuest { quest_id }).await?)
    }

    async fn create_quest(&self, quest: &Quest) -> Result<bool, StoreError> {
        quest.validate()?;
        let inserted = self
            .db
            .process(InsertQuest {
                quest: quest.clone(),
            })
            .await?;
        if !inserted {
            debug!(quest_id = quest.quest_id, "Quest already exists, keeping stored row");
        }
        Ok(inserted)
    }

    async fn add_quest_participant(
        &self,
        quest_id: i64,
        character_id: i64,
        joined_at: i64,
    ) -> Result<bool, StoreError> {
        self.mutate_quest(quest_id, |quest| {
            Ok(quest.add_participant(character_id, joined_at))
        })
        .await
    }

    async fn update_quest_progress(
        &self,
        quest_id: i64,
        progress: u8,
        at: i64,
    ) -> Result<(), StoreError> {
        self.mutate_quest(quest_id, |quest| quest.set_progress(progress, at))
            .await?;
        Ok(())
    }

    async fn complete_quest(
        &self,
        quest_id: i64,
        completed_character_ids: &[i64],
        at: i64,
    ) -> Result<(), StoreError> {
        self.mutate_quest(quest_id, |quest| {
            Ok(quest.complete(completed_character_ids, at))
        })
        .await?;
        Ok(())
    }

    async fn distribute_rewards(
        &self,
        quest_id: i64,
        rewards: Vec<Reward>,
        distributed_at: i64,
    ) -> Result<(), StoreError> {
        self.mutate_quest(quest_id, move |quest| {
            Ok(quest.distribute_rewards(rewards, distributed_at))
        })
        .await?;
        Ok(())
    }
}
