//! Sales Orders domain module.
//!
//! Business rules for sales orders, implemented as deterministic domain logic
//! (no IO, no storage). Every state change raises a domain event into the
//! order's buffer; the outbox capture hook harvests them at commit time.

pub mod order;

pub use order::{
    OrderConfirmed, OrderCreated, OrderLine, OrderLineAdded, SalesOrder, SalesOrderEvent,
    SalesOrderId, SalesOrderStatus, register_events,
};
