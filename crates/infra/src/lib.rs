//! Infrastructure layer: reliable cross-service event delivery.
//!
//! - [`store`]: transactional persistence boundary (in-memory and Postgres)
//! - [`outbox`]: capture hook + relay publishing to the event bus
//! - [`inbox`]: idempotent consumers and delivery dispatch
//! - [`jobs`]: recurring job scheduler driving the relay
//! - [`config`]: per-service settings

pub mod config;
pub mod inbox;
pub mod jobs;
pub mod outbox;
pub mod store;


pub use config::{ConfigError, JobDefinition, OutboxOptions, ServiceConfig};
