use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::MessageId;

use crate::event::IntegrationEvent;
use crate::registry::DecodeError;

/// Transport form of an event, as published on the bus.
///
/// `id` is the originating domain event id. Consumers use it (together with
/// their own name) as the inbox deduplication key, so redeliveries of the same
/// envelope are recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEnvelope {
    id: MessageId,
    event_type: String,
    occurred_on_utc: DateTime<Utc>,
    payload: JsonValue,
}

impl IntegrationEnvelope {
    pub fn new(
        id: MessageId,
        event_type: impl Into<String>,
        occurred_on_utc: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            occurred_on_utc,
            payload,
        }
    }

    /// Wrap a typed event.
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            event.event_id(),
            E::EVENT_TYPE,
            event.occurred_on_utc(),
            serde_json::to_value(event)?,
        ))
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_on_utc(&self) -> DateTime<Utc> {
        self.occurred_on_utc
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload into a concrete event type.
    ///
    /// Fails if the envelope carries a different event type or if the payload
    /// does not match `E`'s shape.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, DecodeError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(DecodeError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                found: self.event_type.clone(),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| DecodeError::Content {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }
}
