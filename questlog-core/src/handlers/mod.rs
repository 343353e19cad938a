//! Aggregate handlers registered as retry queue processors.
//!
//! Each handler owns the event kinds of one aggregate and ignores the rest,
//! so both can be registered on the same queue.

pub mod character;
pub mod quest;

pub use character::CharacterHandler;
pub use quest::QuestHandler;

use crate::events::EventKind;
use crate::persistence::StoreError;
use thiserror::Error;

/// Errors that can occur while applying an event to an aggregate.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The event lacks a field its kind requires
    #[error("{kind} event is missing required field `{field}`")]
    MissingData {
        kind: EventKind,
        field: &'static str,
    },

    /// The event refers to an aggregate that does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Persistence error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Whether redelivering the same event may succeed.
    ///
    /// Only store failures such as lost connections qualify. Malformed events
    /// and rule violations fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            HandlerError::Store(e) => e.is_transient(),
            HandlerError::MissingData { .. } | HandlerError::NotFound { .. } => false,
        }
    }
}
