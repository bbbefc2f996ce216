//! Domain & integration events.
//!
//! - [`DomainEvent`]: what an aggregate buffers during a business operation
//! - [`IntegrationEvent`]: a concrete, serializable event type with a stable name
//! - [`IntegrationEnvelope`]: the transport form published on an [`EventBus`]
//! - [`EventTypeRegistry`]: explicit `type name -> decoder` table
//! - [`IntegrationEventHandler`]: consumer-side business handler

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod registry;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::IntegrationEnvelope;
pub use event::{DomainEvent, IntegrationEvent, serialize_content};
pub use handler::{HandlerError, IntegrationEventHandler};
pub use in_memory_bus::InMemoryEventBus;
pub use registry::{DecodeError, EventTypeRegistry};

#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
    pub use courier_core::MessageId;
    pub use serde_json::Error as JsonError;
}
