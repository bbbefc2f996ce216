use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{AggregateId, AggregateRoot, DomainError, EventBuffer, EventSource, MessageId};
use courier_events::{DomainEvent, EventTypeRegistry, IntegrationEvent, impl_domain_event};

/// Sales order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SalesOrderId(pub AggregateId);

impl SalesOrderId {
    pub fn new() -> Self {
        Self(AggregateId::new())
    }
}

impl Default for SalesOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SalesOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Sales order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SalesOrderStatus {
    Draft,
    Confirmed,
}

/// Order line: sku, quantity, unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub sku: String,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: MessageId,
    pub occurred_on_utc: DateTime<Utc>,
    pub order_id: SalesOrderId,
    pub customer_id: String,
}

/// Event: OrderLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineAdded {
    pub id: MessageId,
    pub occurred_on_utc: DateTime<Utc>,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub sku: String,
    pub quantity: i64,
    pub unit_price: u64,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub id: MessageId,
    pub occurred_on_utc: DateTime<Utc>,
    pub order_id: SalesOrderId,
    pub total: u64,
}

macro_rules! integration_event {
    ($t:ty, $name:literal) => {
        impl IntegrationEvent for $t {
            const EVENT_TYPE: &'static str = $name;

            fn event_id(&self) -> MessageId {
                self.id
            }

            fn occurred_on_utc(&self) -> DateTime<Utc> {
                self.occurred_on_utc
            }
        }
    };
}

integration_event!(OrderCreated, "sales.order.created");
integration_event!(OrderLineAdded, "sales.order.line_added");
integration_event!(OrderConfirmed, "sales.order.confirmed");

impl_domain_event!(OrderCreated, OrderLineAdded, OrderConfirmed);

/// Everything a sales order can raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SalesOrderEvent {
    Created(OrderCreated),
    LineAdded(OrderLineAdded),
    Confirmed(OrderConfirmed),
}

impl SalesOrderEvent {
    fn inner(&self) -> &dyn DomainEvent {
        match self {
            SalesOrderEvent::Created(e) => e,
            SalesOrderEvent::LineAdded(e) => e,
            SalesOrderEvent::Confirmed(e) => e,
        }
    }
}

impl DomainEvent for SalesOrderEvent {
    fn event_id(&self) -> MessageId {
        self.inner().event_id()
    }

    fn occurred_on_utc(&self) -> DateTime<Utc> {
        self.inner().occurred_on_utc()
    }

    fn event_type(&self) -> &'static str {
        self.inner().event_type()
    }

    fn serialize_content(&self) -> Result<String, serde_json::Error> {
        self.inner().serialize_content()
    }
}

/// Register every sales event type with a decoder registry.
pub fn register_events(registry: &mut EventTypeRegistry) {
    registry
        .register::<OrderCreated>()
        .register::<OrderLineAdded>()
        .register::<OrderConfirmed>();
}

/// Aggregate root: SalesOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrder {
    id: SalesOrderId,
    customer_id: String,
    status: SalesOrderStatus,
    lines: Vec<OrderLine>,
    version: u64,
    #[serde(skip)]
    events: EventBuffer<SalesOrderEvent>,
}

impl SalesOrder {
    /// Open a new draft order, raising `OrderCreated`.
    pub fn create(
        id: SalesOrderId,
        customer_id: impl Into<String>,
        occurred_on_utc: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let customer_id = customer_id.into();
        if customer_id.trim().is_empty() {
            return Err(DomainError::validation("customer_id must not be empty"));
        }

        let mut order = Self {
            id,
            customer_id: customer_id.clone(),
            status: SalesOrderStatus::Draft,
            lines: Vec::new(),
            version: 1,
            events: EventBuffer::new(),
        };
        order.events.raise(SalesOrderEvent::Created(OrderCreated {
            id: MessageId::new(),
            occurred_on_utc,
            order_id: id,
            customer_id,
        }));
        Ok(order)
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn status(&self) -> SalesOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn total(&self) -> u64 {
        self.lines.iter().fold(0u64, |acc, l| {
            acc.saturating_add(l.unit_price.saturating_mul(l.quantity.max(0) as u64))
        })
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, SalesOrderStatus::Draft)
    }

    pub fn add_line(
        &mut self,
        sku: impl Into<String>,
        quantity: i64,
        unit_price: u64,
        occurred_on_utc: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.is_modifiable() {
            return Err(DomainError::invariant(
                "cannot modify order once it is confirmed",
            ));
        }
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if unit_price == 0 {
            return Err(DomainError::validation("unit_price must be positive"));
        }

        let line = OrderLine {
            line_no: (self.lines.len() as u32) + 1,
            sku: sku.into(),
            quantity,
            unit_price,
        };
        self.events.raise(SalesOrderEvent::LineAdded(OrderLineAdded {
            id: MessageId::new(),
            occurred_on_utc,
            order_id: self.id,
            line_no: line.line_no,
            sku: line.sku.clone(),
            quantity,
            unit_price,
        }));
        self.lines.push(line);
        self.version += 1;
        Ok(())
    }

    pub fn confirm(&mut self, occurred_on_utc: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_modifiable() {
            return Err(DomainError::conflict("order already confirmed"));
        }
        if self.lines.is_empty() {
            return Err(DomainError::invariant("cannot confirm an order without lines"));
        }

        self.status = SalesOrderStatus::Confirmed;
        self.version += 1;
        self.events.raise(SalesOrderEvent::Confirmed(OrderConfirmed {
            id: MessageId::new(),
            occurred_on_utc,
            order_id: self.id,
            total: self.total(),
        }));
        Ok(())
    }
}

impl AggregateRoot for SalesOrder {
    type Id = SalesOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl EventSource for SalesOrder {
    type Event = SalesOrderEvent;

    fn pending_events(&self) -> &[SalesOrderEvent] {
        self.events.as_slice()
    }

    fn take_events(&mut self) -> Vec<SalesOrderEvent> {
        self.events.take()
    }
}
