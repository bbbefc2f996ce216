//! Idempotent inbox wrapper around a business handler.
//!
//! `handle` runs inside one transaction:
//!
//! 1. look up the `(message id, consumer name)` record; if present, no-op
//! 2. otherwise run the handler, which writes through the same transaction
//! 3. insert the consumer record and commit handler effects + record together
//!
//! A handler failure rolls everything back, so redelivery retries cleanly.
//! Losing a race against a concurrent delivery of the same message surfaces
//! as a uniqueness violation and is reported as [`HandleOutcome::Duplicate`].

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use courier_events::{DecodeError, HandlerError, IntegrationEvent, IntegrationEventHandler};

use crate::store::{InboxConsumerRecord, OutboxDatabase, OutboxTransaction, StoreError};

/// Result of one delivery to one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Effects were applied and the consumer record committed.
    Applied,
    /// The message had already been consumed; nothing changed.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum InboxError {
    /// The wrapped handler failed; its transaction was rolled back.
    #[error("consumer {consumer} failed: {source}")]
    Handler {
        consumer: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Handling was cancelled before commit; nothing was persisted.
    #[error("inbox handling cancelled")]
    Cancelled,

    #[error("consumer {consumer} registered twice for {event_type}")]
    DuplicateRegistration { event_type: String, consumer: String },
}

/// Wraps handler `H` so each message's effects apply at most once.
#[derive(Debug, Clone)]
pub struct InboxConsumer<D, H> {
    db: D,
    handler: H,
    consumer_name: String,
}

impl<D, H> InboxConsumer<D, H>
where
    D: OutboxDatabase,
{
    /// The consumer name defaults to the handler's type name.
    pub fn new(db: D, handler: H) -> Self {
        Self {
            db,
            handler,
            consumer_name: std::any::type_name::<H>().to_string(),
        }
    }

    /// Override the consumer name, e.g. to keep a stable key across renames.
    pub fn with_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.consumer_name = consumer_name.into();
        self
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    #[instrument(
        skip_all,
        fields(
            message_id = %event.event_id(),
            event_type = E::EVENT_TYPE,
            consumer = %self.consumer_name
        ),
        err
    )]
    pub async fn handle<E>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, InboxError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E, D::Tx>,
    {
        if cancel.is_cancelled() {
            return Err(InboxError::Cancelled);
        }

        let record = InboxConsumerRecord::new(event.event_id(), self.consumer_name.as_str());
        let mut tx = self.db.begin().await?;

        if tx.consumer_exists(&record).await? {
            tx.rollback().await?;
            debug!("message already consumed, skipping");
            return Ok(HandleOutcome::Duplicate);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.handler.handle(event, &mut tx) => Some(result),
        };
        match result {
            Some(Ok(())) => {}
            Some(Err(source)) => {
                rollback_quietly(tx).await;
                return Err(InboxError::Handler {
                    consumer: self.consumer_name.clone(),
                    source,
                });
            }
            None => {
                rollback_quietly(tx).await;
                return Err(InboxError::Cancelled);
            }
        }

        match tx.insert_consumer(&record).await {
            Ok(()) => {}
            Err(err) if err.is_duplicate_consumer() => {
                rollback_quietly(tx).await;
                debug!("concurrent delivery consumed the message first");
                return Ok(HandleOutcome::Duplicate);
            }
            Err(err) => return Err(err.into()),
        }

        match tx.commit().await {
            Ok(()) => Ok(HandleOutcome::Applied),
            Err(err) if err.is_duplicate_consumer() => {
                debug!("concurrent delivery consumed the message first");
                Ok(HandleOutcome::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn rollback_quietly<T: OutboxTransaction>(tx: T) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "inbox rollback failed");
    }
}
