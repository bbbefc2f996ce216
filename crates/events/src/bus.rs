//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **bus boundary** between services: the outbox relay
//! publishes envelopes through it, and a transport-side delivery loop hands
//! received envelopes to the idempotent inbox.
//!
//! ## Delivery Guarantees
//!
//! The bus is assumed to provide **at-least-once delivery**:
//! - Envelopes may be delivered multiple times (relay retries, broker redelivery)
//! - Envelopes may be delivered out of order
//! - Consumers must deduplicate on the envelope id (see the inbox in `courier-infra`)
//!
//! The broker itself is an external collaborator; implementations of
//! [`EventBus`] adapt it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::envelope::IntegrationEnvelope;

/// Publish failure reported by a bus transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// The transport could not be reached (network, broker down).
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The transport refused the message.
    #[error("bus rejected message: {0}")]
    Rejected(String),

    /// The bus has been shut down.
    #[error("bus closed")]
    Closed,
}

/// A subscription to the envelopes published on a bus.
///
/// Each subscription gets its own copy of every envelope published after it was
/// created (broadcast semantics). Designed for a single consuming task.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<IntegrationEnvelope>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<IntegrationEnvelope>) -> Self {
        Self { receiver }
    }

    /// Wait for the next envelope; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<IntegrationEnvelope> {
        self.receiver.recv().await
    }

    /// Try to receive an envelope without waiting.
    pub fn try_recv(&mut self) -> Option<IntegrationEnvelope> {
        self.receiver.try_recv().ok()
    }
}

/// Transport-agnostic event bus.
///
/// `publish` suspends on transport IO. A successful return means the transport
/// accepted the envelope; callers record delivery only after that.
///
/// The trait requires `Send + Sync`: relays running on different tasks may
/// publish concurrently.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: &IntegrationEnvelope) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, envelope: &IntegrationEnvelope) -> Result<(), BusError> {
        (**self).publish(envelope).await
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
