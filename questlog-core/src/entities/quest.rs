use crate::entities::{HistoryEntry, InvariantError, append_history};
use crate::framework::{DatabaseAccessor, DatabaseProcessor};
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

pub const PROGRESS_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase", type_name = "quest_status")]
#[serde(rename_all = "lowercase")]
pub enum QuestStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub character_id: i64,
    pub joined_at: i64,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    #[serde(rename = "type")]
    pub reward_type: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed_at: Option<i64>,
}

impl Reward {
    pub fn new(reward_type: impl Into<String>, amount: i64) -> Self {
        Self {
            character_id: None,
            reward_type: reward_type.into(),
            amount,
            distributed_at: None,
        }
    }

    pub fn for_character(mut self, character_id: i64) -> Self {
        self.character_id = Some(character_id);
        self
    }
}

/// Quest aggregate, keyed by the chain quest id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub quest_id: i64,
    pub name: String,
    pub status: QuestStatus,
    pub participants: Vec<Participant>,
    pub progress: u8,
    pub rewards: Vec<Reward>,
    pub history: Vec<HistoryEntry>,
}

impl Quest {
    pub fn new(quest_id: i64, name: String, rewards: Vec<Reward>, created_at: i64) -> Self {
        let details = serde_json::json!({ "name": name });
        let mut quest = Self {
            quest_id,
            name,
            status: QuestStatus::Active,
            participants: Vec::new(),
            progress: 0,
            rewards,
            history: Vec::new(),
        };
        quest.record("created", created_at, details);
        quest
    }

    pub fn validate(&self) -> Result<(), InvariantError> {
        if self.progress > PROGRESS_MAX {
            return Err(InvariantError::ProgressOutOfRange(self.progress));
        }
        Ok(())
    }

    pub fn is_participant(&self, character_id: i64) -> bool {
        self.participants
            .iter()
            .any(|participant| participant.character_id == character_id)
    }

    /// Add a participant. Returns `false` without touching the quest when the
    /// character already joined.
    pub fn add_participant(&mut self, character_id: i64, joined_at: i64) -> bool {
        if self.is_participant(character_id) {
            return false;
        }
        self.participants.push(Participant {
            character_id,
            joined_at,
            status: ParticipantStatus::Active,
        });
        self.record(
            "participant_joined",
            joined_at,
            serde_json::json!({ "characterId": character_id }),
        );
        true
    }

    /// Returns whether anything changed.
    pub fn set_progress(&mut self, progress: u8, at: i64) -> Result<bool, InvariantError> {
        if progress > PROGRESS_MAX {
            return Err(InvariantError::ProgressOutOfRange(progress));
        }
        let recorded = self.record(
            "progress",
            at,
            serde_json::json!({ "progress": progress }),
        );
        let changed = self.progress != progress;
        self.progress = progress;
        Ok(changed || recorded)
    }

    /// Mark the quest and the listed participants completed. Participants not
    /// in `character_ids` keep their status; ids that never joined are ignored.
    pub fn complete(&mut self, character_ids: &[i64], at: i64) -> bool {
        let mut changed = self.status != QuestStatus::Completed;
        self.status = QuestStatus::Completed;
        for participant in &mut self.participants {
            if character_ids.contains(&participant.character_id)
                && participant.status != ParticipantStatus::Completed
            {
                participant.status = ParticipantStatus::Completed;
                changed = true;
            }
        }
        let recorded = self.record(
            "completed",
            at,
            serde_json::json!({ "characterIds": character_ids }),
        );
        changed || recorded
    }

    /// Replace the reward list, stamping every entry with `distributed_at`.
    pub fn distribute_rewards(&mut self, rewards: Vec<Reward>, distributed_at: i64) -> bool {
        let rewards: Vec<Reward> = rewards
            .into_iter()
            .map(|reward| Reward {
                distributed_at: Some(distributed_at),
                ..reward
            })
            .collect();
        let recorded = self.record(
            "rewards_distributed",
            distributed_at,
            serde_json::json!({ "count": rewards.len() }),
        );
        let changed = self.rewards != rewards;
        self.rewards = rewards;
        changed || recorded
    }

    pub fn record(&mut self, action: &str, timestamp: i64, details: serde_json::Value) -> bool {
        append_history(&mut self.history, HistoryEntry::new(action, timestamp, details))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuestRow {
    quest_id: i64,
    name: String,
    status: QuestStatus,
    progress: i16,
    participants: Json<Vec<Participant>>,
    rewards: Json<Vec<Reward>>,
    history: Json<Vec<HistoryEntry>>,
}

impl TryFrom<QuestRow> for Quest {
    type Error = sqlx::Error;

    fn try_from(row: QuestRow) -> Result<Self, Self::Error> {
        let progress = u8::try_from(row.progress).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            quest_id: row.quest_id,
            name: row.name,
            status: row.status,
            participants: row.participants.0,
            progress,
            rewards: row.rewards.0,
            history: row.history.0,
        })
    }
}

const SELECT_QUEST: &str = r#"
    SELECT quest_id, name, status, progress, participants, rewards, history
    FROM quests
"#;

#[derive(Debug, Clone)]
/// Fetch one quest by id.
pub struct GetQuest {
    pub quest_id: i64,
}

impl Processor<GetQuest> for DatabaseProcessor {
    type Output = Option<Quest>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetQuest")]
    async fn process(&self, query: GetQuest) -> Result<Option<Quest>, sqlx::Error> {
        let row = sqlx::query_as::<_, QuestRow>(&format!("{SELECT_QUEST} WHERE quest_id = $1"))
            .bind(query.quest_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Quest::try_from).transpose()
    }
}

#[derive(Debug, Clone)]
/// Insert a new quest. An existing row with the same id is left untouched.
///
/// Returns whether a row was inserted.
pub struct InsertQuest {
    pub quest: Quest,
}

impl Processor<InsertQuest> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertQuest")]
    async fn process(&self, cmd: InsertQuest) -> Result<bool, sqlx::Error> {
        let quest = cmd.quest;
        let result = sqlx::query(
            r#"
            INSERT INTO quests (quest_id, name, status, progress, participants, rewards, history, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (quest_id) DO NOTHING
            "#,
        )
        .bind(quest.quest_id)
        .bind(quest.name)
        .bind(quest.status)
        .bind(i16::from(quest.progress))
        .bind(Json(quest.participants))
        .bind(Json(quest.rewards))
        .bind(Json(quest.history))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl Quest {
    /// Load a quest and lock its row until the surrounding transaction ends.
    pub async fn lock_for_update(
        db: &mut impl DatabaseAccessor,
        quest_id: i64,
    ) -> Result<Option<Quest>, sqlx::Error> {
        let row = sqlx::query_as::<_, QuestRow>(&format!(
            "{SELECT_QUEST} WHERE quest_id = $1 FOR UPDATE"
        ))
        .bind(quest_id)
        .fetch_optional(db.acquire())
        .await?;
        row.map(Quest::try_from).transpose()
    }

    /// Write back the mutable parts of a quest.
    pub async fn save(db: &mut impl DatabaseAccessor, quest: &Quest) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE quests
            SET status = $2, progress = $3, participants = $4, rewards = $5, history = $6, updated_at = NOW()
            WHERE quest_id = $1
            "#,
        )
        .bind(quest.quest_id)
        .bind(quest.status)
        .bind(i16::from(quest.progress))
        .bind(Json(&quest.participants))
        .bind(Json(&quest.rewards))
        .bind(Json(&quest.history))
        .execute(db.acquire())
        .await?;
        Ok(())
    }
}
