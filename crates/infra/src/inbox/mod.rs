//! Idempotent inbox: at-least-once delivery in, at-most-once effects out.

pub mod consumer;
pub mod dispatcher;
pub mod worker;

pub use consumer::{HandleOutcome, InboxConsumer, InboxError};
pub use dispatcher::{DeliveryReport, InboxDispatcher};
pub use worker::{InboxWorker, WorkerHandle};
