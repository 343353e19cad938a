//! Domain event type definitions.

use crate::entities::{EquippedItem, Reward, Stats};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event kinds, one per payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    LevelUp,
    Transfer,
    QuestCreated,
    QuestJoined,
    QuestProgress,
    QuestCompleted,
    QuestRewardsDistributed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntityCreated => "entity-created",
            EventKind::EntityUpdated => "entity-updated",
            EventKind::EntityDeleted => "entity-deleted",
            EventKind::LevelUp => "level-up",
            EventKind::Transfer => "transfer",
            EventKind::QuestCreated => "quest-created",
            EventKind::QuestJoined => "quest-joined",
            EventKind::QuestProgress => "quest-progress",
            EventKind::QuestCompleted => "quest-completed",
            EventKind::QuestRewardsDistributed => "quest-rewards-distributed",
        }
    }

    /// Whether the event targets a character (as opposed to a quest).
    pub fn is_character(&self) -> bool {
        matches!(
            self,
            EventKind::EntityCreated
                | EventKind::EntityUpdated
                | EventKind::EntityDeleted
                | EventKind::LevelUp
                | EventKind::Transfer
        )
    }

    pub fn is_quest(&self) -> bool {
        !self.is_character()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific event data. Each variant carries only the fields its kind
/// needs, so handlers never probe for optional keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    EntityCreated {
        class: String,
        stats: Stats,
        #[serde(default)]
        equipment: Vec<EquippedItem>,
    },
    EntityUpdated {
        stats: Stats,
        #[serde(default)]
        equipment: Vec<EquippedItem>,
    },
    EntityDeleted,
    /// `stats` holds the new absolute values after the level-up.
    LevelUp {
        level: i32,
        stats: Stats,
    },
    Transfer,
    QuestCreated {
        name: String,
        #[serde(default)]
        rewards: Vec<Reward>,
    },
    QuestJoined {
        character_id: i64,
    },
    QuestProgress {
        progress: u8,
    },
    QuestCompleted {
        character_ids: Vec<i64>,
    },
    QuestRewardsDistributed {
        rewards: Vec<Reward>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::EntityCreated { .. } => EventKind::EntityCreated,
            EventPayload::EntityUpdated { .. } => EventKind::EntityUpdated,
            EventPayload::EntityDeleted => EventKind::EntityDeleted,
            EventPayload::LevelUp { .. } => EventKind::LevelUp,
            EventPayload::Transfer => EventKind::Transfer,
            EventPayload::QuestCreated { .. } => EventKind::QuestCreated,
            EventPayload::QuestJoined { .. } => EventKind::QuestJoined,
            EventPayload::QuestProgress { .. } => EventKind::QuestProgress,
            EventPayload::QuestCompleted { .. } => EventKind::QuestCompleted,
            EventPayload::QuestRewardsDistributed { .. } => EventKind::QuestRewardsDistributed,
        }
    }
}

/// One state change observed on chain.
///
/// `timestamp` is the local capture time in whole seconds and is the queue's
/// ordering key. `entity_id` is the token id for character kinds and the
/// quest id for quest kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub entity_id: i64,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_owner: Option<String>,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(entity_id: i64, timestamp: i64, payload: EventPayload) -> Self {
        Self {
            entity_id,
            timestamp,
            owner: None,
            new_owner: None,
            payload,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_new_owner(mut self, new_owner: impl Into<String>) -> Self {
        self.new_owner = Some(new_owner.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// JSON form attached to failure logs so the event can be replayed.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserializable event: {e}>"))
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.kind(), self.entity_id, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_is_derived_from_payload() {
        let event = DomainEvent::new(1, 1000, EventPayload::QuestJoined { character_id: 5 });
        assert_eq!(event.kind(), EventKind::QuestJoined);
        assert!(event.kind().is_quest());
        assert_eq!(event.to_string(), "quest-joined#1@1000");
    }

    #[test]
    fn test_replay_json_shape() {
        let json = json!({
            "entityId": 1,
            "timestamp": 2000,
            "payload": {
                "kind": "level-up",
                "level": 2,
                "stats": {
                    "strength": 12, "dexterity": 8, "constitution": 9,
                    "intelligence": 7, "wisdom": 6, "charisma": 5
                }
            }
        });
        let event: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind(), EventKind::LevelUp);
        let EventPayload::LevelUp { level, stats } = &event.payload else {
            panic!("unexpected payload {:?}", event.payload);
        };
        assert_eq!(*level, 2);
        assert_eq!(stats.strength, 12);
        assert_eq!(event.owner, None);
    }

    #[test]
    fn test_payload_missing_required_field_is_rejected() {
        let json = json!({
            "entityId": 1,
            "timestamp": 2000,
            "payload": { "kind": "quest-joined" }
        });
        assert!(serde_json::from_value::<DomainEvent>(json).is_err());
    }

    #[test]
    fn test_unit_payload_round_trip() {
        let event = DomainEvent::new(3, 10, EventPayload::Transfer)
            .with_owner("0xa")
            .with_new_owner("0xb");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"], json!({ "kind": "transfer" }));
        assert_eq!(json["newOwner"], "0xb");
    }
}
