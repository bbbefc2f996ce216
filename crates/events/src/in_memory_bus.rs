//! In-memory event bus for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, EventBus, Subscription};
use crate::envelope::IntegrationEnvelope;

/// In-memory pub/sub bus.
///
/// - Best-effort fan-out to live subscribers
/// - Keeps a log of every accepted publish (duplicates included)
/// - Scripted failures: queued errors are returned by the next publishes
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<IntegrationEnvelope>>>,
    published: Mutex<Vec<IntegrationEnvelope>>,
    failures: Mutex<VecDeque<BusError>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with `error`.
    pub fn fail_next(&self, count: usize, error: BusError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(std::iter::repeat_n(error, count));
        }
    }

    /// Every envelope the bus accepted, in publish order.
    pub fn published(&self) -> Vec<IntegrationEnvelope> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Number of accepted publishes.
    pub fn publish_count(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: &IntegrationEnvelope) -> Result<(), BusError> {
        let scripted = self
            .failures
            .lock()
            .map_err(|_| BusError::Unavailable("lock poisoned".to_string()))?
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        self.published
            .lock()
            .map_err(|_| BusError::Unavailable("lock poisoned".to_string()))?
            .push(envelope.clone());

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| BusError::Unavailable("lock poisoned".to_string()))?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(envelope.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
