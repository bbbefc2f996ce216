//! Scheduler adapter for the outbox relay.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_events::EventBus;

use crate::jobs::{JobError, RecurringJob};
use crate::store::OutboxDatabase;

use super::relay::{OutboxRelay, RelayError};

/// Runs one relay cycle per scheduler tick.
///
/// Registered under [`OUTBOX_RELAY_JOB_TYPE`](crate::config::OUTBOX_RELAY_JOB_TYPE).
#[derive(Debug)]
pub struct OutboxRelayJob<D, B> {
    relay: Arc<OutboxRelay<D, B>>,
}

impl<D, B> OutboxRelayJob<D, B> {
    pub fn new(relay: Arc<OutboxRelay<D, B>>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<OutboxRelay<D, B>> {
        &self.relay
    }
}

#[async_trait]
impl<D, B> RecurringJob for OutboxRelayJob<D, B>
where
    D: OutboxDatabase + 'static,
    B: EventBus + 'static,
{
    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError> {
        match self.relay.run_cycle(&cancel).await {
            Ok(report) if report.cancelled => Err(JobError::Cancelled),
            Ok(_) => Ok(()),
            Err(RelayError::CycleInProgress) => {
                debug!("relay cycle already running, nothing to do");
                Ok(())
            }
            Err(err) => Err(JobError::failed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use courier_events::{EventTypeRegistry, InMemoryEventBus};
    use courier_sales::{SalesOrder, SalesOrderId, register_events};

    use crate::config::{JobDefinition, OUTBOX_RELAY_JOB_TYPE, OutboxOptions};
    use crate::jobs::{JobRegistry, Scheduler};
    use crate::outbox::OutboxCapture;
    use crate::store::InMemoryDatabase;

    #[tokio::test]
    async fn scheduled_relay_drains_the_outbox() {
        let db = InMemoryDatabase::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let mut registry = EventTypeRegistry::new();
        register_events(&mut registry);

        let mut order = SalesOrder::create(SalesOrderId::new(), "cust-7", Utc::now()).unwrap();
        let mut uow = OutboxCapture::begin(&db).await.unwrap();
        uow.capture(&mut order).unwrap();
        uow.commit().await.unwrap();

        let relay = Arc::new(OutboxRelay::new(
            db.clone(),
            Arc::clone(&bus),
            Arc::new(registry),
            &OutboxOptions::default(),
        ));
        let mut jobs = JobRegistry::new();
        jobs.register(OUTBOX_RELAY_JOB_TYPE, Arc::new(OutboxRelayJob::new(relay)));

        let definitions = [JobDefinition::outbox_relay(&OutboxOptions::default())];
        let handle = Scheduler::from_definitions(&jobs, &definitions).unwrap().spawn();

        let mut drained = false;
        for _ in 0..50 {
            if db.unprocessed_count() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats(&definitions[0].name).unwrap();
        handle.shutdown().await;

        assert!(drained);
        assert_eq!(bus.publish_count(), 1);
        assert!(stats.runs >= 1);
    }
}
