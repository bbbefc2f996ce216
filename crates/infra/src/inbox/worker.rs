use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_events::{EventBus, Subscription};

use crate::store::OutboxDatabase;

use super::dispatcher::InboxDispatcher;

/// Handle to control and join a background inbox worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// An in-flight delivery is aborted before commit and will be redelivered.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "inbox worker ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Delivery loop between a bus subscription and an [`InboxDispatcher`].
///
/// - Subscribes to the bus at spawn time
/// - Runs every envelope through the idempotent inbox
/// - Stops on shutdown or when the bus goes away
#[derive(Debug)]
pub struct InboxWorker;

impl InboxWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn<B, D>(name: &'static str, bus: &B, dispatcher: Arc<InboxDispatcher<D>>) -> WorkerHandle
    where
        B: EventBus + ?Sized,
        D: OutboxDatabase + Clone + 'static,
    {
        let cancel = CancellationToken::new();
        let sub = bus.subscribe();
        let join = tokio::spawn(worker_loop(name, sub, dispatcher, cancel.clone()));

        WorkerHandle {
            cancel,
            join: Some(join),
        }
    }
}

async fn worker_loop<D>(
    name: &'static str,
    mut sub: Subscription,
    dispatcher: Arc<InboxDispatcher<D>>,
    cancel: CancellationToken,
) where
    D: OutboxDatabase + Clone + 'static,
{
    info!(worker = name, "inbox worker started");

    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            envelope = sub.recv() => match envelope {
                Some(envelope) => envelope,
                None => {
                    debug!(worker = name, "bus closed");
                    break;
                }
            },
        };

        let report = dispatcher.deliver(&envelope, &cancel).await;
        if !report.failed.is_empty() {
            warn!(
                worker = name,
                message_id = %envelope.id(),
                failed = ?report.failed,
                "inbox delivery failed for some consumers"
            );
        }
        if report.cancelled {
            break;
        }
    }

    info!(worker = name, "inbox worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use courier_core::MessageId;
    use courier_events::{HandlerError, InMemoryEventBus, IntegrationEnvelope, IntegrationEventHandler};
    use courier_sales::{OrderCreated, SalesOrderId};

    use crate::store::{InMemoryDatabase, InMemoryTransaction};

    struct Recorder;

    #[async_trait]
    impl IntegrationEventHandler<OrderCreated, InMemoryTransaction> for Recorder {
        async fn handle(&self, event: &OrderCreated, tx: &mut InMemoryTransaction) -> Result<(), HandlerError> {
            tx.put_row("seen", event.id.to_string(), serde_json::json!(event.customer_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_applies_published_envelopes_once() {
        let db = InMemoryDatabase::new();
        let bus = InMemoryEventBus::new();
        let mut dispatcher = InboxDispatcher::new(db.clone());
        dispatcher.register::<OrderCreated, _>(Recorder).unwrap();
        let handle = InboxWorker::spawn("test-inbox", &bus, Arc::new(dispatcher));

        let envelope = IntegrationEnvelope::from_event(&OrderCreated {
            id: MessageId::new(),
            occurred_on_utc: Utc::now(),
            order_id: SalesOrderId::new(),
            customer_id: "cust-9".to_string(),
        })
        .unwrap();
        bus.publish(&envelope).await.unwrap();
        bus.publish(&envelope).await.unwrap();

        let mut consumed = 0;
        for _ in 0..50 {
            consumed = db.consumer_records().len();
            if consumed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;

        assert_eq!(consumed, 1);
        assert_eq!(db.rows("seen").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_worker() {
        let bus = InMemoryEventBus::new();
        let dispatcher = Arc::new(InboxDispatcher::new(InMemoryDatabase::new()));
        let handle = InboxWorker::spawn("idle", &bus, dispatcher);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
    }
}
