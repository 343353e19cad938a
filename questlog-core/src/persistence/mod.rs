//! Persistence service used by the event handlers.
//!
//! Every mutation is idempotent: the retry queue may deliver the same event
//! more than once, and applying it again must leave the same stored state.

pub mod memory;
pub mod postgres;

pub use memory::MemoryPersistence;
pub use postgres::PgPersistence;

use crate::entities::{Character, InvariantError, Quest, Reward};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Aggregate rule violated; nothing was written
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    /// Mutation of an aggregate that does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Connection could not be established within the retry budget
    #[error("store unavailable after {attempts} connection attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => is_transient_sqlx(e),
            StoreError::Unavailable { .. } => true,
            StoreError::Invariant(_) | StoreError::NotFound { .. } => false,
        }
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

/// Mutation and lookup API over the materialized aggregates.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_character(&self, token_id: i64) -> Result<Option<Character>, StoreError>;

    async fn characters_by_owner(&self, owner: &str) -> Result<Vec<Character>, StoreError>;

    /// Validate and write the full character state (last write wins per key).
    async fn upsert_character(&self, character: &Character) -> Result<(), StoreError>;

    /// Returns whether the character existed.
    async fn delete_character(&self, token_id: i64) -> Result<bool, StoreError>;

    async fn get_quest(&self, quest_id: i64) -> Result<Option<Quest>, StoreError>;

    /// Insert a quest; an existing quest with the same id is kept as is.
    /// Returns whether it was inserted.
    async fn create_quest(&self, quest: &Quest) -> Result<bool, StoreError>;

    /// Returns `false` when the character already participates.
    async fn add_quest_participant(
        &self,
        quest_id: i64,
        character_id: i64,
        joined_at: i64,
    ) -> Result<bool, StoreError>;

    async fn update_quest_progress(
        &self,
        quest_id: i64,
        progress: u8,
        at: i64,
    ) -> Result<(), StoreError>;

    /// Mark the quest and the listed participants completed.
    async fn complete_quest(
        &self,
        quest_id: i64,
        completed_character_ids: &[i64],
        at: i64,
    ) -> Result<(), StoreError>;

    /// Replace the reward list, stamping each entry with `distributed_at`.
    async fn distribute_rewards(
        &self,
        quest_id: i64,
        rewards: Vec<Reward>,
        distributed_at: i64,
    ) -> Result<(), StoreError>;
}
