use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use courier_core::MessageId;

/// A concrete event type that can cross a service boundary.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **identified** by a `MessageId` assigned when they are raised
/// - **named** by a stable, fully-qualified `EVENT_TYPE` (e.g. "sales.order.created")
///
/// The serialized form is `serde_json` in field declaration order, so the same
/// event always produces the same content and decodes back to an equal value.
pub trait IntegrationEvent:
    Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static
{
    /// Stable event name used to resolve a decoder for stored content.
    const EVENT_TYPE: &'static str;

    fn event_id(&self) -> MessageId;

    /// When the event occurred (business time).
    fn occurred_on_utc(&self) -> DateTime<Utc>;
}

/// An event raised by an aggregate and buffered until commit.
///
/// This is the object-safe view the outbox capture hook works with. Aggregates
/// usually buffer an enum of their events; each variant reports the type name
/// and content of the concrete event it wraps.
pub trait DomainEvent: core::fmt::Debug + Send + Sync {
    fn event_id(&self) -> MessageId;

    fn occurred_on_utc(&self) -> DateTime<Utc>;

    /// Runtime type name of the concrete event.
    fn event_type(&self) -> &'static str;

    /// Deterministic serialized payload of the concrete event.
    fn serialize_content(&self) -> Result<String, serde_json::Error>;
}

/// Serialize an integration event the way the outbox stores it.
pub fn serialize_content<E: IntegrationEvent>(event: &E) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Implement [`DomainEvent`] for one or more [`IntegrationEvent`] types.
#[macro_export]
macro_rules! impl_domain_event {
    ($($t:ty),+ $(,)?) => {
        $(
            impl $crate::DomainEvent for $t {
                fn event_id(&self) -> $crate::__private::MessageId {
                    <$t as $crate::IntegrationEvent>::event_id(self)
                }

                fn occurred_on_utc(&self) -> $crate::__private::DateTime<$crate::__private::Utc> {
                    <$t as $crate::IntegrationEvent>::occurred_on_utc(self)
                }

                fn event_type(&self) -> &'static str {
                    <$t as $crate::IntegrationEvent>::EVENT_TYPE
                }

                fn serialize_content(&self) -> Result<String, $crate::__private::JsonError> {
                    $crate::serialize_content(self)
                }
            }
        )+
    };
}
