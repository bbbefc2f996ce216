use async_trait::async_trait;
use thiserror::Error;

use crate::event::IntegrationEvent;

/// Failure raised by a business handler.
///
/// Any handler failure rolls back the surrounding inbox transaction, so the
/// message is retried on its next delivery.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler refused the event (business rule).
    #[error("handler rejected event: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Handles an inbound integration event (consumer-side handler abstraction).
///
/// `C` is the persistence context the handler writes through, typically the
/// open transaction of the idempotent inbox. Writing through it is what makes
/// the handler's effects commit or roll back together with the consumption
/// record.
///
/// Handlers are not expected to deduplicate themselves; wrap them in the inbox
/// consumer instead.
#[async_trait]
pub trait IntegrationEventHandler<E, C>: Send + Sync
where
    E: IntegrationEvent,
    C: Send,
{
    async fn handle(&self, event: &E, ctx: &mut C) -> Result<(), HandlerError>;
}
