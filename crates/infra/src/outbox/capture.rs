//! Unit-of-work capture hook.
//!
//! Business code opens an [`OutboxCapture`], writes its own rows through
//! [`OutboxCapture::transaction`], hands every touched aggregate to
//! [`OutboxCapture::capture`], and finally calls [`OutboxCapture::commit`].
//! The harvested events are inserted as outbox rows into the same transaction
//! right before it commits, so business state and notifications are durable
//! together or not at all.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use courier_core::EventSource;
use courier_events::DomainEvent;

use crate::store::{OutboxDatabase, OutboxMessage, OutboxTransaction, StoreError};

#[derive(Debug, Error)]
pub enum CaptureError {
    /// An event could not be serialized. The whole unit of work is void.
    #[error("failed to serialize {event_type} event {message_id}: {reason}")]
    Serialization {
        event_type: &'static str,
        message_id: courier_core::MessageId,
        reason: String,
    },

    /// A previous capture failed; the unit of work can only roll back.
    #[error("unit of work aborted by an earlier capture failure")]
    Aborted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An open business transaction that collects domain events as outbox rows.
#[derive(Debug)]
pub struct OutboxCapture<T: OutboxTransaction> {
    tx: T,
    staged: Vec<OutboxMessage>,
    aborted: bool,
}

impl<T: OutboxTransaction> OutboxCapture<T> {
    pub async fn begin<D>(db: &D) -> Result<Self, CaptureError>
    where
        D: OutboxDatabase<Tx = T>,
    {
        Ok(Self::new(db.begin().await?))
    }

    /// Wrap an already open transaction.
    pub fn new(tx: T) -> Self {
        Self {
            tx,
            staged: Vec::new(),
            aborted: false,
        }
    }

    /// The underlying transaction, for the business writes.
    pub fn transaction(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Rows captured so far, in capture order.
    pub fn staged(&self) -> &[OutboxMessage] {
        &self.staged
    }

    /// Drain `aggregate`'s buffered events into outbox rows.
    ///
    /// Every pending event is serialized before any is drained: on failure the
    /// aggregate keeps its events and this unit of work can no longer commit.
    pub fn capture<A>(&mut self, aggregate: &mut A) -> Result<usize, CaptureError>
    where
        A: EventSource,
        A::Event: DomainEvent,
    {
        if self.aborted {
            return Err(CaptureError::Aborted);
        }

        let mut rows = Vec::with_capacity(aggregate.pending_events().len());
        for event in aggregate.pending_events() {
            match OutboxMessage::from_event(event) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    self.aborted = true;
                    warn!(
                        message_id = %event.event_id(),
                        event_type = event.event_type(),
                        error = %e,
                        "domain event serialization failed, unit of work aborted"
                    );
                    return Err(CaptureError::Serialization {
                        event_type: event.event_type(),
                        message_id: event.event_id(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let drained = aggregate.take_events();
        debug_assert_eq!(drained.len(), rows.len());
        let count = rows.len();
        self.staged.extend(rows);
        Ok(count)
    }

    /// Insert the captured rows and commit everything.
    ///
    /// Returns the number of outbox rows written. If anything fails, nothing
    /// of the unit of work is persisted.
    #[instrument(skip(self), fields(messages = self.staged.len()), err)]
    pub async fn commit(mut self) -> Result<usize, CaptureError> {
        if self.aborted {
            self.tx.rollback().await?;
            return Err(CaptureError::Aborted);
        }

        let count = self.staged.len();
        if count > 0 {
            self.tx.insert_outbox_messages(&self.staged).await?;
        }
        self.tx.commit().await?;

        debug!(messages = count, "unit of work committed");
        Ok(count)
    }

    pub async fn rollback(self) -> Result<(), CaptureError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
