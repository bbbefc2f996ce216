//! Outbox relay: publishes unprocessed outbox rows to the event bus.
//!
//! One cycle runs in one transaction:
//!
//! 1. select up to `batch_size` unprocessed rows, oldest first, locking them
//!    (rows locked by another replica are skipped)
//! 2. for each row: resolve the event type, decode the content, publish with
//!    the transport retry budget, then mark it processed or record the error
//! 3. commit all row updates
//!
//! A failing row never blocks the others. A crash after a publish and before
//! the commit republishes on the next cycle; consumers deduplicate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use courier_events::{BusError, EventBus, EventTypeRegistry, IntegrationEnvelope};

use crate::config::OutboxOptions;
use crate::jobs::RetryPolicy;
use crate::store::{OutboxDatabase, OutboxMessage, OutboxTransaction, StoreError};

#[derive(Debug, Error)]
pub enum RelayError {
    /// Another cycle of this relay is still running.
    #[error("relay cycle already in progress")]
    CycleInProgress,

    /// The cycle was aborted; its transaction rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one relay cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows selected for this cycle.
    pub fetched: usize,
    pub published: usize,
    /// Rows left unprocessed with `error` set.
    pub failed: usize,
    /// Rows published but already marked processed by someone else.
    pub skipped: usize,
    /// The cycle stopped early on cancellation.
    pub cancelled: bool,
}

enum PublishOutcome {
    Published,
    Failed(BusError),
    Cancelled,
}

/// Single-flight flag, released on drop.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outbox relay over one service database.
#[derive(Debug)]
pub struct OutboxRelay<D, B> {
    db: D,
    bus: B,
    registry: Arc<EventTypeRegistry>,
    batch_size: usize,
    retry: RetryPolicy,
    running: AtomicBool,
}

impl<D, B> OutboxRelay<D, B>
where
    D: OutboxDatabase,
    B: EventBus,
{
    /// `options.retry_count` becomes the publish retry budget, with the
    /// default exponential backoff between attempts.
    pub fn new(db: D, bus: B, registry: Arc<EventTypeRegistry>, options: &OutboxOptions) -> Self {
        Self {
            db,
            bus,
            registry,
            batch_size: options.batch_size,
            retry: RetryPolicy {
                max_retries: options.retry_count,
                ..RetryPolicy::default()
            },
            running: AtomicBool::new(false),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one relay cycle.
    ///
    /// Fails with [`RelayError::CycleInProgress`] if a cycle is already running
    /// on this relay. On cancellation the cycle stops before the next row (or
    /// aborts the in-flight publish), commits what it already did and reports
    /// `cancelled`.
    #[instrument(skip(self, cancel), fields(batch_size = self.batch_size), err)]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, RelayError> {
        let _guard = CycleGuard::acquire(&self.running).ok_or(RelayError::CycleInProgress)?;

        let mut report = CycleReport::default();
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let mut tx = self.db.begin().await?;
        let batch = tx.fetch_unprocessed(self.batch_size).await?;
        report.fetched = batch.len();

        for message in &batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let envelope = match self.registry.resolve(
                message.id,
                &message.event_type,
                message.occurred_on_utc,
                &message.content,
            ) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(
                        message_id = %message.id,
                        event_type = %message.event_type,
                        error = %err,
                        "cannot resolve outbox message"
                    );
                    self.record_failure(&mut tx, message, &err.to_string()).await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.publish_with_retry(&envelope, cancel).await {
                PublishOutcome::Published => {
                    if tx.mark_processed(message.id, Utc::now()).await? {
                        report.published += 1;
                    } else {
                        warn!(
                            message_id = %message.id,
                            "outbox message already processed elsewhere"
                        );
                        report.skipped += 1;
                    }
                }
                PublishOutcome::Failed(err) => {
                    self.record_failure(&mut tx, message, &err.to_string()).await?;
                    report.failed += 1;
                }
                PublishOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        tx.commit().await?;

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                cancelled = report.cancelled,
                "outbox relay cycle finished"
            );
        } else {
            debug!("outbox relay cycle found nothing to publish");
        }
        Ok(report)
    }

    async fn record_failure(
        &self,
        tx: &mut D::Tx,
        message: &OutboxMessage,
        error: &str,
    ) -> Result<(), StoreError> {
        if !tx.record_error(message.id, error).await? {
            debug!(message_id = %message.id, "outbox message already processed, error not recorded");
        }
        Ok(())
    }

    /// Publish with up to `retry.max_retries` retries, backing off between
    /// attempts. Cancellation aborts a pending publish or backoff.
    async fn publish_with_retry(
        &self,
        envelope: &IntegrationEnvelope,
        cancel: &CancellationToken,
    ) -> PublishOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PublishOutcome::Cancelled,
                result = self.bus.publish(envelope) => result,
            };

            match result {
                Ok(()) => {
                    debug!(
                        message_id = %envelope.id(),
                        event_type = envelope.event_type(),
                        attempts,
                        "outbox message published"
                    );
                    return PublishOutcome::Published;
                }
                Err(err) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for_retry(attempts);
                    debug!(
                        message_id = %envelope.id(),
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return PublishOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(
                        message_id = %envelope.id(),
                        event_type = envelope.event_type(),
                        attempts,
                        error = %err,
                        "publish failed, message stays unprocessed"
                    );
                    return PublishOutcome::Failed(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use courier_core::{EventSource, MessageId};
    use courier_events::{DomainEvent, InMemoryEventBus};
    use courier_sales::{SalesOrder, SalesOrderId, register_events};

    use crate::outbox::OutboxCapture;
    use crate::store::InMemoryDatabase;

    fn registry() -> Arc<EventTypeRegistry> {
        let mut registry = EventTypeRegistry::new();
        register_events(&mut registry);
        Arc::new(registry)
    }

    fn relay(
        db: &InMemoryDatabase,
        bus: &Arc<InMemoryEventBus>,
        retry_count: u32,
    ) -> OutboxRelay<InMemoryDatabase, Arc<InMemoryEventBus>> {
        let options = OutboxOptions {
            retry_count,
            ..OutboxOptions::default()
        };
        OutboxRelay::new(db.clone(), Arc::clone(bus), registry(), &options)
            .with_retry_policy(RetryPolicy::fixed(retry_count, Duration::ZERO))
    }

    async fn create_order(db: &InMemoryDatabase) -> MessageId {
        let mut order = SalesOrder::create(SalesOrderId::new(), "cust-1", Utc::now()).unwrap();
        let id = order.pending_events()[0].event_id();
        let mut uow = OutboxCapture::begin(db).await.unwrap();
        uow.capture(&mut order).unwrap();
        uow.commit().await.unwrap();
        id
    }

    async fn insert_raw(db: &InMemoryDatabase, event_type: &str, content: &str) -> MessageId {
        let message = OutboxMessage {
            id: MessageId::new(),
            occurred_on_utc: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            event_type: event_type.to_string(),
            content: content.to_string(),
            processed_on_utc: None,
            error: None,
        };
        let id = message.id;
        let mut tx = db.begin().await.unwrap();
        tx.insert_outbox_messages(&[message]).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn transient_failures_within_budget_still_publish() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let id = create_order(&db).await;
        bus.fail_next(2, BusError::Unavailable("broker restarting".into()));

        let report = relay(&db, &bus, 3).run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(bus.publish_count(), 1);
        assert!(db.outbox_message(id).unwrap().is_processed());
    }

    #[tokio::test]
    async fn exhausted_budget_records_error_and_keeps_row() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let id = create_order(&db).await;
        bus.fail_next(2, BusError::Unavailable("broker down".into()));

        let report = relay(&db, &bus, 1).run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 0);
        let row = db.outbox_message(id).unwrap();
        assert!(!row.is_processed());
        assert_eq!(row.error.as_deref(), Some("bus unavailable: broker down"));

        let report = relay(&db, &bus, 1).run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 1);
        let row = db.outbox_message(id).unwrap();
        assert!(row.is_processed());
        assert_eq!(row.error, None);
    }

    #[tokio::test]
    async fn unknown_types_and_bad_content_do_not_block_the_batch() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let unknown = insert_raw(&db, "billing.invoice.paid", "{}").await;
        let malformed = insert_raw(&db, "sales.order.created", "not json").await;
        let good = create_order(&db).await;

        let report = relay(&db, &bus, 0).run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.published, 1);
        assert!(db.outbox_message(good).unwrap().is_processed());
        for id in [unknown, malformed] {
            let row = db.outbox_message(id).unwrap();
            assert!(!row.is_processed());
            assert!(row.error.is_some());
        }
        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.published()[0].id(), good);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_refused() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let relay = relay(&db, &bus, 0);

        let guard = CycleGuard::acquire(&relay.running).unwrap();
        assert!(matches!(
            relay.run_cycle(&CancellationToken::new()).await,
            Err(RelayError::CycleInProgress)
        ));
        drop(guard);
        assert!(relay.run_cycle(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_token_publishes_nothing() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        create_order(&db).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = relay(&db, &bus, 0).run_cycle(&cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(bus.publish_count(), 0);
        assert_eq!(db.unprocessed_count(), 1);
    }

    #[tokio::test]
    async fn batch_size_bounds_each_cycle() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        for _ in 0..5 {
            create_order(&db).await;
        }
        let options = OutboxOptions {
            batch_size: 2,
            ..OutboxOptions::default()
        };
        let relay = OutboxRelay::new(db.clone(), Arc::clone(&bus), registry(), &options);

        let report = relay.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(db.unprocessed_count(), 3);
    }

    #[tokio::test]
    async fn poison_rows_do_not_starve_newer_messages() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        insert_raw(&db, "billing.invoice.paid", "{}").await;
        insert_raw(&db, "sales.order.created", "not json").await;
        let good = create_order(&db).await;

        let options = OutboxOptions {
            batch_size: 2,
            ..OutboxOptions::default()
        };
        let relay = OutboxRelay::new(db.clone(), Arc::clone(&bus), registry(), &options);
        let cancel = CancellationToken::new();

        let first = relay.run_cycle(&cancel).await.unwrap();
        assert_eq!(first.failed, 2);
        assert_eq!(first.published, 0);

        let second = relay.run_cycle(&cancel).await.unwrap();
        assert_eq!(second.published, 1);
        assert!(db.outbox_message(good).unwrap().is_processed());
        assert_eq!(db.unprocessed_count(), 2);
    }
}
