//! `courier-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate roots that buffer domain events, identifiers, and the domain error model.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, EventBuffer, EventSource};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, MessageId};
