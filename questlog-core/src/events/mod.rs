//! Domain events and the normalizer that produces them.
//!
//! # Event Flow
//!
//! 1. `ChainWatcher` reads a `RawLog` for a verified block
//! 2. `normalizer::normalize` turns it into a `DomainEvent`
//! 3. The event is pushed onto the `RetryQueue`
//! 4. `CharacterHandler` / `QuestHandler` apply it to the store
//!
//! Events are immutable once built; a retried delivery reuses the same value.

pub mod normalizer;
pub mod types;

pub use normalizer::{ContractEvent, NormalizeError, RawLog, normalize};
pub use types::{DomainEvent, EventKind, EventPayload};
