//! Persistence boundary for outbox messages and inbox consumer records.
//!
//! This module defines the transactional unit-of-work abstraction that the
//! capture hook, the relay, and the inbox all work through, plus an in-memory
//! backend (tests/dev) and a Postgres backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryDatabase, InMemoryTransaction};
pub use postgres::{PostgresDatabase, PostgresTransaction};
pub use r#trait::{InboxConsumerRecord, OutboxDatabase, OutboxMessage, OutboxTransaction, StoreError};
