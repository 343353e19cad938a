pub mod character;
pub mod quest;

pub use character::{Character, EquipmentSlot, EquippedItem, Stats};
pub use quest::{Participant, ParticipantStatus, Quest, QuestStatus, Reward};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rule violations detected before an aggregate is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("equipment slot {0} is occupied more than once")]
    DuplicateEquipmentSlot(EquipmentSlot),

    #[error("stat {name} = {value} is outside 0..={max}", max = character::STAT_MAX)]
    StatOutOfRange { name: &'static str, value: u16 },

    #[error("quest progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
}

/// One entry of an aggregate's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    pub timestamp: i64,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl HistoryEntry {
    pub fn new(action: impl Into<String>, timestamp: i64, details: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            timestamp,
            details,
        }
    }
}

/// Append `entry` unless an identical one is already recorded.
///
/// Redelivered events carry the same timestamp and details, so this keeps
/// history stable under at-least-once delivery. Returns whether it appended.
pub(crate) fn append_history(history: &mut Vec<HistoryEntry>, entry: HistoryEntry) -> bool {
    if history.contains(&entry) {
        return false;
    }
    history.push(entry);
    true
}
