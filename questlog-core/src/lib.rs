#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

//! Ingestion core for the character/quest contract.
//!
//! Chain logs flow through [`chain::ChainWatcher`], are normalized into
//! [`events::DomainEvent`]s, buffered and ordered by [`queue::RetryQueue`],
//! and applied to the store by the aggregate handlers in [`handlers`].

pub mod chain;
pub mod config;
pub mod entities;
pub mod events;
pub mod framework;
pub mod handlers;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod utils;
