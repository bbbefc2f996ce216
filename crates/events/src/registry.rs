//! Explicit event-type registration.
//!
//! Stored outbox rows only carry a type name and opaque content. The registry
//! maps each name to a decoder for the concrete event type. It is populated
//! once at the composition root; nothing is discovered at runtime.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use courier_core::MessageId;

use crate::envelope::IntegrationEnvelope;
use crate::event::IntegrationEvent;

/// Failure to turn stored or transported content into a typed event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("event type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("malformed {event_type} content: {reason}")]
    Content { event_type: String, reason: String },
}

type DecodeFn = fn(&str, &str) -> Result<JsonValue, DecodeError>;

fn decode_as<E: IntegrationEvent>(event_type: &str, content: &str) -> Result<JsonValue, DecodeError> {
    let content_error = |e: serde_json::Error| DecodeError::Content {
        event_type: event_type.to_string(),
        reason: e.to_string(),
    };
    let event: E = serde_json::from_str(content).map_err(content_error)?;
    serde_json::to_value(&event).map_err(content_error)
}

/// `event type name -> decoder` table.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete event type under its `EVENT_TYPE` name.
    ///
    /// Registering the same type twice is a no-op.
    pub fn register<E: IntegrationEvent>(&mut self) -> &mut Self {
        self.decoders.insert(E::EVENT_TYPE, decode_as::<E>);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<E: IntegrationEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Resolve `event_type`, decode `content` through the concrete type, and
    /// build the transport envelope.
    pub fn resolve(
        &self,
        id: MessageId,
        event_type: &str,
        occurred_on_utc: DateTime<Utc>,
        content: &str,
    ) -> Result<IntegrationEnvelope, DecodeError> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownType(event_type.to_string()))?;
        let payload = decode(event_type, content)?;
        Ok(IntegrationEnvelope::new(id, event_type, occurred_on_utc, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PriceChanged {
        id: MessageId,
        occurred_on_utc: DateTime<Utc>,
        sku: String,
        price: u64,
    }

    impl IntegrationEvent for PriceChanged {
        const EVENT_TYPE: &'static str = "catalog.price.changed";

        fn event_id(&self) -> MessageId {
            self.id
        }

        fn occurred_on_utc(&self) -> DateTime<Utc> {
            self.occurred_on_utc
        }
    }

    fn sample() -> PriceChanged {
        PriceChanged {
            id: MessageId::new(),
            occurred_on_utc: Utc::now(),
            sku: "SKU-1".to_string(),
            price: 1299,
        }
    }

    #[test]
    fn resolves_registered_type_into_envelope() {
        let registry = EventTypeRegistry::new().with::<PriceChanged>();
        let event = sample();
        let content = crate::serialize_content(&event).unwrap();

        let env = registry
            .resolve(event.id, PriceChanged::EVENT_TYPE, event.occurred_on_utc, &content)
            .unwrap();

        assert_eq!(env.id(), event.id);
        assert_eq!(env.decode::<PriceChanged>().unwrap(), event);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = EventTypeRegistry::new();
        let err = registry
            .resolve(MessageId::new(), "nope", Utc::now(), "{}")
            .unwrap_err();
        assert_eq!(err, DecodeError::UnknownType("nope".to_string()));
    }

    #[test]
    fn malformed_content_is_rejected() {
        let registry = EventTypeRegistry::new().with::<PriceChanged>();
        let err = registry
            .resolve(MessageId::new(), PriceChanged::EVENT_TYPE, Utc::now(), r#"{"sku":1}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Content { .. }));
    }

    #[test]
    fn envelope_decode_checks_the_type_name() {
        let env = IntegrationEnvelope::new(MessageId::new(), "other", Utc::now(), serde_json::json!({}));
        assert!(matches!(
            env.decode::<PriceChanged>(),
            Err(DecodeError::TypeMismatch { .. })
        ));
    }
}
