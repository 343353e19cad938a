use crate::entities::{HistoryEntry, InvariantError, append_history};
use crate::framework::DatabaseProcessor;
use itertools::Itertools;
use kanau::processor::Processor;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;

/// Upper bound of every character attribute.
pub const STAT_MAX: u16 = 255;

/// The six character attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub strength: u16,
    pub dexterity: u16,
    pub constitution: u16,
    pub intelligence: u16,
    pub wisdom: u16,
    pub charisma: u16,
}

impl Stats {
    /// Attribute names in contract order.
    pub const NAMES: [&'static str; 6] = [
        "strength",
        "dexterity",
        "constitution",
        "intelligence",
        "wisdom",
        "charisma",
    ];

    pub fn from_array(values: [u16; 6]) -> Self {
        let [strength, dexterity, constitution, intelligence, wisdom, charisma] = values;
        Self {
            strength,
            dexterity,
            constitution,
            intelligence,
            wisdom,
            charisma,
        }
    }

    pub fn to_array(self) -> [u16; 6] {
        [
            self.strength,
            self.dexterity,
            self.constitution,
            self.intelligence,
            self.wisdom,
            self.charisma,
        ]
    }

    pub fn validate(&self) -> Result<(), InvariantError> {
        for (name, value) in Self::NAMES.into_iter().zip(self.to_array()) {
            if value > STAT_MAX {
                return Err(InvariantError::StatOutOfRange { name, value });
            }
        }
        Ok(())
    }
}

/// Equipment slots a character can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentSlot {
    Weapon,
    Armor,
    Helmet,
    Boots,
    Accessory,
}

impl EquipmentSlot {
    /// Slot by its on-chain index.
    pub fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(Self::Weapon),
            1 => Some(Self::Armor),
            2 => Some(Self::Helmet),
            3 => Some(Self::Boots),
            4 => Some(Self::Accessory),
            _ => None,
        }
    }
}

impl fmt::Display for EquipmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EquipmentSlot::Weapon => "weapon",
            EquipmentSlot::Armor => "armor",
            EquipmentSlot::Helmet => "helmet",
            EquipmentSlot::Boots => "boots",
            EquipmentSlot::Accessory => "accessory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquippedItem {
    pub slot: EquipmentSlot,
    pub item_id: i64,
    pub equipped_at: i64,
}

/// Character aggregate, keyed by the chain token id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub token_id: i64,
    pub owner: String,
    pub class: String,
    pub level: i32,
    pub stats: Stats,
    pub equipment: Vec<EquippedItem>,
    pub history: Vec<HistoryEntry>,
}

impl Character {
    /// A freshly minted character at level 1 with a `created` history entry.
    pub fn new(
        token_id: i64,
        owner: String,
        class: String,
        stats: Stats,
        equipment: Vec<EquippedItem>,
        created_at: i64,
    ) -> Self {
        let details = serde_json::json!({ "owner": owner, "class": class });
        let mut character = Self {
            token_id,
            owner,
            class,
            level: 1,
            stats,
            equipment,
            history: Vec::new(),
        };
        character.record("created", created_at, details);
        character
    }

    /// Check the aggregate rules that must hold before every write.
    pub fn validate(&self) -> Result<(), InvariantError> {
        self.stats.validate()?;
        if let Some(slot) = self.equipment.iter().map(|item| item.slot).duplicates().next() {
            return Err(InvariantError::DuplicateEquipmentSlot(slot));
        }
        Ok(())
    }

    /// Append a history entry; identical entries are recorded once.
    pub fn record(&mut self, action: &str, timestamp: i64, details: serde_json::Value) -> bool {
        append_history(&mut self.history, HistoryEntry::new(action, timestamp, details))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CharacterRow {
    token_id: i64,
    owner: String,
    class: String,
    level: i32,
    stats: Json<Stats>,
    equipment: Json<Vec<EquippedItem>>,
    history: Json<Vec<HistoryEntry>>,
}

impl From<CharacterRow> for Character {
    fn from(row: CharacterRow) -> Self {
        Self {
            token_id: row.token_id,
            owner: row.owner,
            class: row.class,
            level: row.level,
            stats: row.stats.0,
            equipment: row.equipment.0,
            history: row.history.0,
        }
    }
}

const SELECT_CHARACTER: &str = r#"
    SELECT token_id, owner, class, level, stats, equipment, history
    FROM characters
"#;

#[derive(Debug, Clone)]
/// Fetch one character by token id.
pub struct GetCharacter {
    pub token_id: i64,
}

impl Processor<GetCharacter> for DatabaseProcessor {
    type Output = Option<Character>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetCharacter")]
    async fn process(&self, query: GetCharacter) -> Result<Option<Character>, sqlx::Error> {
        let row = sqlx::query_as::<_, CharacterRow>(&format!(
            "{SELECT_CHARACTER} WHERE token_id = $1"
        ))
        .bind(query.token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Character::from))
    }
}

#[derive(Debug, Clone)]
/// Fetch every character held by an address. Addresses compare case-insensitively.
pub struct GetCharactersByOwner {
    pub owner: String,
}

impl Processor<GetCharactersByOwner> for DatabaseProcessor {
    type Output = Vec<Character>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetCharactersByOwner")]
    async fn process(&self, query: GetCharactersByOwner) -> Result<Vec<Character>, sqlx::Error> {
        let rows = sqlx::query_as::<_, CharacterRow>(&format!(
            "{SELECT_CHARACTER} WHERE lower(owner) = lower($1) ORDER BY token_id ASC"
        ))
        .bind(query.owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Character::from).collect())
    }
}

#[derive(Debug, Clone)]
/// Write the full character state. The row is replaced on conflict, so the
/// last write per token id wins.
pub struct UpsertCharacter {
    pub character: Character,
}

impl Processor<UpsertCharacter> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertCharacter")]
    async fn process(&self, cmd: UpsertCharacter) -> Result<(), sqlx::Error> {
        let Character {
            token_id,
            owner,
            class,
            level,
            stats,
            equipment,
            history,
        } = cmd.character;
        sqlx::query(
            r#"
            INSERT INTO characters (token_id, owner, class, level, stats, equipment, history, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (token_id) DO UPDATE SET
                owner = EXCLUDED.owner,
                class = EXCLUDED.class,
                level = EXCLUDED.level,
                stats = EXCLUDED.stats,
                equipment = EXCLUDED.equipment,
                history = EXCLUDED.history,
                updated_at = NOW()
            "#,
        )
        .bind(token_id)
        .bind(owner)
        .bind(class)
        .bind(level)
        .bind(Json(stats))
        .bind(Json(equipment))
        .bind(Json(history))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Remove a character row. Returns whether a row existed.
pub struct DeleteCharacter {
    pub token_id: i64,
}

impl Processor<DeleteCharacter> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeleteCharacter")]
    async fn process(&self, cmd: DeleteCharacter) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM characters WHERE token_id = $1")
            .bind(cmd.token_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(strength: u16) -> Stats {
        Stats {
            strength,
            dexterity: 8,
            constitution: 9,
            intelligence: 7,
            wisdom: 6,
            charisma: 5,
        }
    }

    fn item(slot: EquipmentSlot, item_id: i64) -> EquippedItem {
        EquippedItem {
            slot,
            item_id,
            equipped_at: 1000,
        }
    }

    #[test]
    fn test_new_character_starts_with_created_entry() {
        let character = Character::new(1, "0xabc".into(), "mage".into(), stats(10), vec![], 1000);
        assert_eq!(character.level, 1);
        assert_eq!(character.history.len(), 1);
        assert_eq!(character.history[0].action, "created");
        assert!(character.validate().is_ok());
    }

    #[test]
    fn test_duplicate_slot_is_rejected() {
        let mut character =
            Character::new(1, "0xabc".into(), "mage".into(), stats(10), vec![], 1000);
        character.equipment = vec![
            item(EquipmentSlot::Weapon, 1),
            item(EquipmentSlot::Armor, 2),
            item(EquipmentSlot::Weapon, 3),
        ];
        assert_eq!(
            character.validate(),
            Err(InvariantError::DuplicateEquipmentSlot(EquipmentSlot::Weapon))
        );
    }

    #[test]
    fn test_stat_bound() {
        assert!(stats(STAT_MAX).validate().is_ok());
        assert_eq!(
            stats(STAT_MAX + 1).validate(),
            Err(InvariantError::StatOutOfRange {
                name: "strength",
                value: STAT_MAX + 1
            })
        );
    }

    #[test]
    fn test_stats_array_order_matches_names() {
        let stats = Stats::from_array([1, 2, 3, 4, 5, 6]);
        assert_eq!(stats.dexterity, 2);
        assert_eq!(stats.charisma, 6);
        assert_eq!(stats.to_array(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_slot_indices() {
        assert_eq!(EquipmentSlot::from_index(0), Some(EquipmentSlot::Weapon));
        assert_eq!(EquipmentSlot::from_index(4), Some(EquipmentSlot::Accessory));
        assert_eq!(EquipmentSlot::from_index(5), None);
    }
}
