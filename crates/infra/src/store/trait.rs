use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::MessageId;
use courier_events::DomainEvent;

/// Persisted form of an outbound notification.
///
/// Rows are created inside the same transaction as the business mutation that
/// raised the event. `processed_on_utc` is set exactly once, when the relay has
/// published the message; from then on the row is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// The originating domain event id (also the inbox dedup key downstream).
    pub id: MessageId,
    pub occurred_on_utc: DateTime<Utc>,
    /// Registered name of the concrete event type.
    pub event_type: String,
    /// Serialized event payload, opaque to the store.
    pub content: String,
    pub processed_on_utc: Option<DateTime<Utc>>,
    /// Last publish failure, if any.
    pub error: Option<String>,
}

impl OutboxMessage {
    /// Serialize a domain event into a new, unprocessed row.
    pub fn from_event(event: &dyn DomainEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: event.event_id(),
            occurred_on_utc: event.occurred_on_utc(),
            event_type: event.event_type().to_string(),
            content: event.serialize_content()?,
            processed_on_utc: None,
            error: None,
        })
    }

    pub fn is_processed(&self) -> bool {
        self.processed_on_utc.is_some()
    }
}

/// "This consumer has already produced its effects for this message."
///
/// `(message_id, consumer_name)` is unique in every backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InboxConsumerRecord {
    pub message_id: MessageId,
    pub consumer_name: String,
}

impl InboxConsumerRecord {
    pub fn new(message_id: MessageId, consumer_name: impl Into<String>) -> Self {
        Self {
            message_id,
            consumer_name: consumer_name.into(),
        }
    }
}

/// Persistence error.
///
/// The two `Duplicate*` variants are uniqueness-constraint violations. For
/// consumer records that is the signal that a concurrent delivery already
/// handled the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("outbox message already exists: {0}")]
    DuplicateMessage(MessageId),

    #[error("message {message_id} already consumed by {consumer_name}")]
    DuplicateConsumer {
        message_id: MessageId,
        consumer_name: String,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_duplicate_consumer(&self) -> bool {
        matches!(self, StoreError::DuplicateConsumer { .. })
    }
}

/// Opens transactions against one service database.
#[async_trait]
pub trait OutboxDatabase: Send + Sync {
    type Tx: OutboxTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open database transaction.
///
/// Nothing written through a transaction is visible to others until `commit`
/// succeeds. Dropping a transaction without committing rolls it back.
///
/// ## Concurrency
///
/// - `fetch_unprocessed` locks the rows it returns for the rest of the
///   transaction and skips rows locked by other transactions, so two relay
///   replicas never select the same message at the same time.
/// - `mark_processed` / `record_error` only touch rows whose
///   `processed_on_utc` is still null and report whether a row changed.
/// - Consumer records are unique on `(message_id, consumer_name)`; a
///   violation surfaces as [`StoreError::DuplicateConsumer`] from
///   `insert_consumer` or from `commit`.
#[async_trait]
pub trait OutboxTransaction: Send + Sized {
    async fn insert_outbox_messages(&mut self, messages: &[OutboxMessage]) -> Result<(), StoreError>;

    /// Up to `batch_size` unprocessed messages, oldest `occurred_on_utc` first
    /// (ties broken by id). Rows with a recorded `error` come after every row
    /// that has not failed yet, so poison rows cannot starve the batch.
    async fn fetch_unprocessed(&mut self, batch_size: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn outbox_message(&mut self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError>;

    /// Set `processed_on_utc` and clear `error`.
    async fn mark_processed(
        &mut self,
        id: MessageId,
        processed_on_utc: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record the last publish failure, leaving the message unprocessed.
    async fn record_error(&mut self, id: MessageId, error: &str) -> Result<bool, StoreError>;

    async fn consumer_exists(&mut self, record: &InboxConsumerRecord) -> Result<bool, StoreError>;

    async fn insert_consumer(&mut self, record: &InboxConsumerRecord) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
