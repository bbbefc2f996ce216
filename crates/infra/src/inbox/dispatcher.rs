//! Explicit `event type -> handlers` table for inbound deliveries.
//!
//! Handlers are registered at the composition root; each registration is
//! wrapped in its own [`InboxConsumer`], so every handler deduplicates
//! independently and one handler's failure does not affect the others.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use courier_core::MessageId;
use courier_events::{IntegrationEnvelope, IntegrationEvent, IntegrationEventHandler};

use crate::store::OutboxDatabase;

use super::consumer::{HandleOutcome, InboxConsumer, InboxError};

/// Type-erased inbox consumer for one event type.
#[async_trait]
trait DeliveryHandler: Send + Sync {
    fn consumer_name(&self) -> &str;

    async fn deliver(
        &self,
        envelope: &IntegrationEnvelope,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, InboxError>;
}

struct TypedHandler<E, D, H> {
    consumer: InboxConsumer<D, H>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, D, H> DeliveryHandler for TypedHandler<E, D, H>
where
    E: IntegrationEvent,
    D: OutboxDatabase + 'static,
    H: IntegrationEventHandler<E, D::Tx> + 'static,
{
    fn consumer_name(&self) -> &str {
        self.consumer.consumer_name()
    }

    async fn deliver(
        &self,
        envelope: &IntegrationEnvelope,
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, InboxError> {
        let event: E = envelope.decode()?;
        self.consumer.handle(&event, cancel).await
    }
}

/// What happened to one delivered envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: Option<MessageId>,
    /// Consumers that applied the message.
    pub applied: Vec<String>,
    /// Consumers that had already seen it.
    pub duplicates: Vec<String>,
    /// `(consumer, error)` for every consumer that failed.
    pub failed: Vec<(String, String)>,
    /// No consumer is registered for the event type.
    pub unhandled: bool,
    pub cancelled: bool,
}

impl DeliveryReport {
    /// True when no consumer failed and the delivery was not cut short, i.e.
    /// the transport may acknowledge the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Routes envelopes to the inbox consumers registered for their type.
pub struct InboxDispatcher<D> {
    db: D,
    handlers: HashMap<&'static str, Vec<Arc<dyn DeliveryHandler>>>,
}

impl<D> InboxDispatcher<D>
where
    D: OutboxDatabase + Clone + 'static,
{
    pub fn new(db: D) -> Self {
        Self {
            db,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `E`, named after its type.
    pub fn register<E, H>(&mut self, handler: H) -> Result<&mut Self, InboxError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E, D::Tx> + 'static,
    {
        let consumer = InboxConsumer::new(self.db.clone(), handler);
        self.insert::<E, H>(consumer)
    }

    /// Register `handler` for `E` under an explicit consumer name.
    pub fn register_named<E, H>(
        &mut self,
        consumer_name: impl Into<String>,
        handler: H,
    ) -> Result<&mut Self, InboxError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E, D::Tx> + 'static,
    {
        let consumer = InboxConsumer::new(self.db.clone(), handler).with_name(consumer_name);
        self.insert::<E, H>(consumer)
    }

    fn insert<E, H>(&mut self, consumer: InboxConsumer<D, H>) -> Result<&mut Self, InboxError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E, D::Tx> + 'static,
    {
        let handlers = self.handlers.entry(E::EVENT_TYPE).or_default();
        if handlers
            .iter()
            .any(|h| h.consumer_name() == consumer.consumer_name())
        {
            return Err(InboxError::DuplicateRegistration {
                event_type: E::EVENT_TYPE.to_string(),
                consumer: consumer.consumer_name().to_string(),
            });
        }
        handlers.push(Arc::new(TypedHandler::<E, D, H> {
            consumer,
            _event: PhantomData,
        }));
        Ok(self)
    }

    /// Consumer names registered for `event_type`, in registration order.
    pub fn consumers(&self, event_type: &str) -> Vec<&str> {
        self.handlers
            .get(event_type)
            .map(|hs| hs.iter().map(|h| h.consumer_name()).collect())
            .unwrap_or_default()
    }

    /// Hand `envelope` to every consumer registered for its type, in order.
    #[instrument(
        skip_all,
        fields(message_id = %envelope.id(), event_type = envelope.event_type())
    )]
    pub async fn deliver(
        &self,
        envelope: &IntegrationEnvelope,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            message_id: Some(envelope.id()),
            ..DeliveryReport::default()
        };

        let Some(handlers) = self.handlers.get(envelope.event_type()) else {
            debug!("no consumer registered, ignoring");
            report.unhandled = true;
            return report;
        };

        for handler in handlers {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let consumer = handler.consumer_name().to_string();
            match handler.deliver(envelope, cancel).await {
                Ok(HandleOutcome::Applied) => report.applied.push(consumer),
                Ok(HandleOutcome::Duplicate) => report.duplicates.push(consumer),
                Err(InboxError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!(consumer = %consumer, error = %err, "inbox consumer failed");
                    report.failed.push((consumer, err.to_string()));
                }
            }
        }
        report
    }
}

impl<D> std::fmt::Debug for InboxDispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: HashMap<_, Vec<_>> = self
            .handlers
            .iter()
            .map(|(k, hs)| (*k, hs.iter().map(|h| h.consumer_name()).collect()))
            .collect();
        f.debug_struct("InboxDispatcher")
            .field("routes", &routes)
            .finish()
    }
}
