//! Turns raw contract logs into [`DomainEvent`]s.
//!
//! A log is identified by its first topic, the keccak-256 hash of the event
//! signature. Indexed arguments come from the remaining topics and the rest
//! are ABI-decoded from the data field.

use crate::entities::{EquipmentSlot, EquippedItem, Reward, Stats};
use crate::events::types::{DomainEvent, EventPayload};
use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use std::fmt;
use thiserror::Error;

/// A contract log as delivered by the chain adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// First topic: the event selector.
    pub selector: H256,
    /// Remaining topics, one per indexed argument.
    pub indexed_args: Vec<H256>,
    /// ABI-encoded non-indexed arguments.
    pub data: Vec<u8>,
    /// Hash of the block the node says the log belongs to.
    pub block_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
}

/// Events emitted by the character/quest contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractEvent {
    CharacterCreated,
    CharacterUpdated,
    CharacterBurned,
    CharacterLeveledUp,
    Transfer,
    QuestCreated,
    QuestJoined,
    QuestProgressUpdated,
    QuestCompleted,
    QuestRewardsDistributed,
}

impl ContractEvent {
    pub const ALL: [ContractEvent; 10] = [
        ContractEvent::CharacterCreated,
        ContractEvent::CharacterUpdated,
        ContractEvent::CharacterBurned,
        ContractEvent::CharacterLeveledUp,
        ContractEvent::Transfer,
        ContractEvent::QuestCreated,
        ContractEvent::QuestJoined,
        ContractEvent::QuestProgressUpdated,
        ContractEvent::QuestCompleted,
        ContractEvent::QuestRewardsDistributed,
    ];

    /// Canonical Solidity signature, as hashed into the selector.
    pub fn signature(&self) -> &'static str {
        match self {
            // (uint256 indexed tokenId, address indexed owner, string class, uint256[6] stats)
            ContractEvent::CharacterCreated => "CharacterCreated(uint256,address,string,uint256[6])",
            // (uint256 indexed tokenId, uint256[6] stats, uint256[] slots, uint256[] itemIds)
            ContractEvent::CharacterUpdated => {
                "CharacterUpdated(uint256,uint256[6],uint256[],uint256[])"
            }
            // (uint256 indexed tokenId)
            ContractEvent::CharacterBurned => "CharacterBurned(uint256)",
            // (uint256 indexed tokenId, uint256 level, uint256[6] stats)
            ContractEvent::CharacterLeveledUp => "CharacterLeveledUp(uint256,uint256,uint256[6])",
            // ERC-721: (address indexed from, address indexed to, uint256 indexed tokenId)
            ContractEvent::Transfer => "Transfer(address,address,uint256)",
            // (uint256 indexed questId, string name, string rewardType, uint256 rewardAmount)
            ContractEvent::QuestCreated => "QuestCreated(uint256,string,string,uint256)",
            // (uint256 indexed questId, uint256 indexed characterId)
            ContractEvent::QuestJoined => "QuestJoined(uint256,uint256)",
            // (uint256 indexed questId, uint256 progress)
            ContractEvent::QuestProgressUpdated => "QuestProgressUpdated(uint256,uint256)",
            // (uint256 indexed questId, uint256[] characterIds)
            ContractEvent::QuestCompleted => "QuestCompleted(uint256,uint256[])",
            // (uint256 indexed questId, uint256[] characterIds, uint256[] amounts, string rewardType)
            ContractEvent::QuestRewardsDistributed => {
                "QuestRewardsDistributed(uint256,uint256[],uint256[],string)"
            }
        }
    }

    pub fn selector(&self) -> H256 {
        H256::from(keccak256(self.signature().as_bytes()))
    }

    pub fn from_selector(selector: &H256) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event| event.selector() == *selector)
    }

    /// Types of the non-indexed arguments, in data order.
    fn data_params(&self) -> Vec<ParamType> {
        let uint = || ParamType::Uint(256);
        let uint_array = || ParamType::Array(Box::new(ParamType::Uint(256)));
        let stats = || ParamType::FixedArray(Box::new(ParamType::Uint(256)), 6);
        match self {
            ContractEvent::CharacterCreated => vec![ParamType::String, stats()],
            ContractEvent::CharacterUpdated => vec![stats(), uint_array(), uint_array()],
            ContractEvent::CharacterBurned => vec![],
            ContractEvent::CharacterLeveledUp => vec![uint(), stats()],
            ContractEvent::Transfer => vec![],
            ContractEvent::QuestCreated => vec![ParamType::String, ParamType::String, uint()],
            ContractEvent::QuestJoined => vec![],
            ContractEvent::QuestProgressUpdated => vec![uint()],
            ContractEvent::QuestCompleted => vec![uint_array()],
            ContractEvent::QuestRewardsDistributed => {
                vec![uint_array(), uint_array(), ParamType::String]
            }
        }
    }
}

impl fmt::Display for ContractEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signature = self.signature();
        let name = signature.split('(').next().unwrap_or(signature);
        f.write_str(name)
    }
}

/// Errors that can occur while normalizing a log.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// Selector of an event this build does not know about
    #[error("unrecognized log selector {0:?}")]
    UnknownSelector(H256),

    #[error("{event}: missing indexed argument #{index}")]
    MissingTopic { event: ContractEvent, index: usize },

    #[error("{event}: ABI decoding failed: {source}")]
    Abi {
        event: ContractEvent,
        #[source]
        source: abi::Error,
    },

    #[error("{event}: argument {field} has an unexpected type")]
    UnexpectedToken {
        event: ContractEvent,
        field: &'static str,
    },

    #[error("{event}: argument {field} is out of range")]
    OutOfRange {
        event: ContractEvent,
        field: &'static str,
    },

    #[error("{event}: arrays {left} and {right} differ in length")]
    LengthMismatch {
        event: ContractEvent,
        left: &'static str,
        right: &'static str,
    },
}

impl NormalizeError {
    /// Unknown selectors are expected from newer contract versions and are
    /// only worth a warning.
    pub fn is_unknown_selector(&self) -> bool {
        matches!(self, NormalizeError::UnknownSelector(_))
    }
}

/// Build the domain event for one raw log.
///
/// `captured_at` becomes the event timestamp. Returns `Ok(None)` for logs
/// that are recognized but carry no state change of their own (ERC-721
/// mint and burn transfers, which the dedicated events already describe).
pub fn normalize(log: &RawLog, captured_at: i64) -> Result<Option<DomainEvent>, NormalizeError> {
    let event = ContractEvent::from_selector(&log.selector)
        .ok_or(NormalizeError::UnknownSelector(log.selector))?;
    let mut args = LogArgs::decode(event, log)?;

    let domain_event = match event {
        ContractEvent::CharacterCreated => {
            let token_id = args.topic_int(0, "tokenId")?;
            let owner = args.topic_address(1)?;
            let class = args.string("class")?;
            let stats = args.stats()?;
            DomainEvent::new(
                token_id,
                captured_at,
                EventPayload::EntityCreated {
                    class,
                    stats,
                    equipment: Vec::new(),
                },
            )
            .with_owner(format_address(&owner))
        }
        ContractEvent::CharacterUpdated => {
            let token_id = args.topic_int(0, "tokenId")?;
            let stats = args.stats()?;
            let slots = args.int_array::<u64>("slots")?;
            let item_ids = args.int_array::<i64>("itemIds")?;
            if slots.len() != item_ids.len() {
                return Err(NormalizeError::LengthMismatch {
                    event,
                    left: "slots",
                    right: "itemIds",
                });
            }
            let mut equipment = Vec::with_capacity(slots.len());
            for (slot, item_id) in slots.into_iter().zip(item_ids) {
                let slot = EquipmentSlot::from_index(slot)
                    .ok_or(NormalizeError::OutOfRange { event, field: "slots" })?;
                // Item id 0 marks an empty slot
                if item_id != 0 {
                    equipment.push(EquippedItem {
                        slot,
                        item_id,
                        equipped_at: captured_at,
                    });
                }
            }
            DomainEvent::new(
                token_id,
                captured_at,
                EventPayload::EntityUpdated { stats, equipment },
            )
        }
        ContractEvent::CharacterBurned => {
            let token_id = args.topic_int(0, "tokenId")?;
            DomainEvent::new(token_id, captured_at, EventPayload::EntityDeleted)
        }
        ContractEvent::CharacterLeveledUp => {
            let token_id = args.topic_int(0, "tokenId")?;
            let level = args.int::<i32>("level")?;
            let stats = args.stats()?;
            DomainEvent::new(
                token_id,
                captured_at,
                EventPayload::LevelUp { level, stats },
            )
        }
        ContractEvent::Transfer => {
            let from = args.topic_address(0)?;
            let to = args.topic_address(1)?;
            let token_id = args.topic_int(2, "tokenId")?;
            if from.is_zero() || to.is_zero() {
                return Ok(None);
            }
            DomainEvent::new(token_id, captured_at, EventPayload::Transfer)
                .with_owner(format_address(&from))
                .with_new_owner(format_address(&to))
        }
        ContractEvent::QuestCreated => {
            let quest_id = args.topic_int(0, "questId")?;
            let name = args.string("name")?;
            let reward_type = args.string("rewardType")?;
            let amount = args.int::<i64>("rewardAmount")?;
            let rewards = if amount > 0 {
                vec![Reward::new(reward_type, amount)]
            } else {
                Vec::new()
            };
            DomainEvent::new(
                quest_id,
                captured_at,
                EventPayload::QuestCreated { name, rewards },
            )
        }
        ContractEvent::QuestJoined => {
            let quest_id = args.topic_int(0, "questId")?;
            let character_id = args.topic_int(1, "characterId")?;
            DomainEvent::new(
                quest_id,
                captured_at,
                EventPayload::QuestJoined { character_id },
            )
        }
        ContractEvent::QuestProgressUpdated => {
            let quest_id = args.topic_int(0, "questId")?;
            let progress = args.int::<u8>("progress")?;
            DomainEvent::new(
                quest_id,
                captured_at,
                EventPayload::QuestProgress { progress },
            )
        }
        ContractEvent::QuestCompleted => {
            let quest_id = args.topic_int(0, "questId")?;
            let character_ids = args.int_array::<i64>("characterIds")?;
            DomainEvent::new(
                quest_id,
                captured_at,
                EventPayload::QuestCompleted { character_ids },
            )
        }
        ContractEvent::QuestRewardsDistributed => {
            let quest_id = args.topic_int(0, "questId")?;
            let character_ids = args.int_array::<i64>("characterIds")?;
            let amounts = args.int_array::<i64>("amounts")?;
            let reward_type = args.string("rewardType")?;
            if character_ids.len() != amounts.len() {
                return Err(NormalizeError::LengthMismatch {
                    event,
                    left: "characterIds",
                    right: "amounts",
                });
            }
            let rewards = character_ids
                .into_iter()
                .zip(amounts)
                .map(|(character_id, amount)| {
                    Reward::new(reward_type.clone(), amount).for_character(character_id)
                })
                .collect();
            DomainEvent::new(
                quest_id,
                captured_at,
                EventPayload::QuestRewardsDistributed { rewards },
            )
        }
    };

    Ok(Some(domain_event))
}

/// Lowercase `0x`-prefixed hex, the form addresses are stored in.
pub fn format_address(address: &Address) -> String {
    format!("{address:?}")
}

/// Cursor over the decoded arguments of one log.
struct LogArgs<'a> {
    event: ContractEvent,
    topics: &'a [H256],
    data: std::vec::IntoIter<Token>,
}

impl<'a> LogArgs<'a> {
    fn decode(event: ContractEvent, log: &'a RawLog) -> Result<Self, NormalizeError> {
        let tokens = abi::decode(&event.data_params(), &log.data)
            .map_err(|source| NormalizeError::Abi { event, source })?;
        Ok(Self {
            event,
            topics: &log.indexed_args,
            data: tokens.into_iter(),
        })
    }

    fn topic(&self, index: usize) -> Result<&H256, NormalizeError> {
        self.topics.get(index).ok_or(NormalizeError::MissingTopic {
            event: self.event,
            index,
        })
    }

    fn topic_int(&self, index: usize, field: &'static str) -> Result<i64, NormalizeError> {
        let value = U256::from_big_endian(self.topic(index)?.as_bytes());
        narrow(self.event, field, value)
    }

    fn topic_address(&self, index: usize) -> Result<Address, NormalizeError> {
        Ok(Address::from(*self.topic(index)?))
    }

    fn next(&mut self, field: &'static str) -> Result<Token, NormalizeError> {
        self.data.next().ok_or(NormalizeError::UnexpectedToken {
            event: self.event,
            field,
        })
    }

    fn int<T: TryFrom<u64>>(&mut self, field: &'static str) -> Result<T, NormalizeError> {
        let event = self.event;
        let value = self
            .next(field)?
            .into_uint()
            .ok_or(NormalizeError::UnexpectedToken { event, field })?;
        narrow(event, field, value)
    }

    fn string(&mut self, field: &'static str) -> Result<String, NormalizeError> {
        let event = self.event;
        self.next(field)?
            .into_string()
            .ok_or(NormalizeError::UnexpectedToken { event, field })
    }

    fn int_array<T: TryFrom<u64>>(&mut self, field: &'static str) -> Result<Vec<T>, NormalizeError> {
        let event = self.event;
        let items = match self.next(field)? {
            Token::Array(items) | Token::FixedArray(items) => items,
            _ => return Err(NormalizeError::UnexpectedToken { event, field }),
        };
        items
            .into_iter()
            .map(|token| {
                let value = token
                    .into_uint()
                    .ok_or(NormalizeError::UnexpectedToken { event, field })?;
                narrow(event, field, value)
            })
            .collect()
    }

    fn stats(&mut self) -> Result<Stats, NormalizeError> {
        let values = self.int_array::<u16>("stats")?;
        let values: [u16; 6] = values.try_into().map_err(|_| NormalizeError::OutOfRange {
            event: self.event,
            field: "stats",
        })?;
        Ok(Stats::from_array(values))
    }
}

fn narrow<T: TryFrom<u64>>(
    event: ContractEvent,
    field: &'static str,
    value: U256,
) -> Result<T, NormalizeError> {
    if value > U256::from(u64::MAX) {
        return Err(NormalizeError::OutOfRange { event, field });
    }
    T::try_from(value.as_u64()).map_err(|_| NormalizeError::OutOfRange { event, field })
}
