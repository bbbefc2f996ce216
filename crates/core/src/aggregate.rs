//! Aggregate roots and their buffered domain events.

/// Aggregate root marker + minimal interface.
///
/// An aggregate is the consistency boundary of a business transaction. It does
/// not perform IO; anything that happened to it is recorded as a domain event in
/// its [`EventBuffer`] and harvested by infrastructure at commit time.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    fn version(&self) -> u64;
}

/// Drain-and-clear access to the domain events an aggregate raised.
///
/// The aggregate exclusively owns its buffered events until they are taken.
/// After `take_events` the buffer is empty and ownership has moved to the
/// caller (typically the outbox capture hook).
pub trait EventSource {
    type Event;

    /// Events raised since the last harvest, oldest first.
    fn pending_events(&self) -> &[Self::Event];

    /// Remove and return all buffered events in the order they were raised.
    fn take_events(&mut self) -> Vec<Self::Event>;
}

/// FIFO buffer of domain events owned by an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBuffer<E> {
    events: Vec<E>,
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a new event at the back of the buffer.
    pub fn raise(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn as_slice(&self) -> &[E] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drain every buffered event, preserving order.
    pub fn take(&mut self) -> Vec<E> {
        core::mem::take(&mut self.events)
    }
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn take_empties_the_buffer() {
        let mut buffer = EventBuffer::new();
        buffer.raise("created");
        buffer.raise("confirmed");

        assert_eq!(buffer.take(), vec!["created", "confirmed"]);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());
    }

    proptest! {
        #[test]
        fn take_preserves_raise_order(events in proptest::collection::vec(any::<u32>(), 0..64)) {
            let mut buffer = EventBuffer::new();
            for e in &events {
                buffer.raise(*e);
            }
            prop_assert_eq!(buffer.len(), events.len());
            prop_assert_eq!(buffer.take(), events);
            prop_assert!(buffer.is_empty());
        }
    }
}
