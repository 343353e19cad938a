//! In-process store with the same rules as the Postgres one.
//!
//! Backs the test suite and local runs without a database.

use crate::entities::{Character, InvariantError, Quest, Reward};
use crate::persistence::{PersistenceService, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryPersistence {
    characters: RwLock<HashMap<i64, Character>>,
    quests: RwLock<HashMap<i64, Quest>>,
    writes: AtomicU64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    async fn mutate_quest<F>(&self, quest_id: i64, mutate: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Quest) -> Result<bool, InvariantError> + Send,
    {
        let mut quests = self.quests.write().await;
        let stored = quests.get(&quest_id).ok_or(StoreError::NotFound {
            entity: "quest",
            id: quest_id,
        })?;
        // Mutate a copy so a rejected change leaves the stored quest untouched
        let mut quest = stored.clone();
        let changed = mutate(&mut quest)?;
        if changed {
            quest.validate()?;
            quests.insert(quest_id, quest);
            self.committed();
        }
        Ok(changed)
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistence {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_character(&self, token_id: i64) -> Result<Option<Character>, StoreError> {
        Ok(self.characters.read().await.get(&token_id).cloned())
    }

    async fn characters_by_owner(&self, owner: &str) -> Result<Vec<Character>, StoreError> {
        let characters = self.characters.read().await;
        let mut owned: Vec<Character> = characters
            .values()
            .filter(|character| character.owner.eq_ignore_ascii_case(owner))
            .cloned()
            .collect();
        owned.sort_by_key(|character| character.token_id);
        Ok(owned)
    }

    async fn upsert_character(&self, character: &Character) -> Result<(), StoreError> {
        character.validate()?;
        self.characters
            .write()
            .await
            .insert(character.token_id, character.clone());
        self.committed();
        Ok(())
    }

    async fn delete_character(&self, token_id: i64) -> Result<bool, StoreError> {
        let removed = self.characters.write().await.remove(&token_id).is_some();
        if removed {
            self.committed();
        }
        Ok(removed)
    }

    async fn get_quest(&self, quest_id: i64) -> Result<Option<Quest>, StoreError> {
        Ok(self.quests.read().await.get(&quest_id).cloned())
    }

    async fn create_quest(&self, quest: &Quest) -> Result<bool, StoreError> {
        quest.validate()?;
        let mut quests = self.quests.write().await;
        if quests.contains_key(&quest.quest_id) {
            return Ok(false);
        }
        quests.insert(quest.quest_id, quest.clone());
        self.committed();
        Ok(true)
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
