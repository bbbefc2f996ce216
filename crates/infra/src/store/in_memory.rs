//! In-memory transactional store for tests/dev.
//!
//! Writes are staged per transaction and applied atomically on commit, with
//! the same constraints the Postgres schema enforces (primary key on outbox
//! ids, uniqueness of consumer records). Row claims made by
//! `fetch_unprocessed` emulate `FOR UPDATE SKIP LOCKED`.
//!
//! Alongside the outbox tables it keeps generic "business" tables
//! (`table -> key -> JSON`), so aggregates and handlers can write their own
//! state through the same transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use courier_core::MessageId;

use super::r#trait::{InboxConsumerRecord, OutboxDatabase, OutboxMessage, OutboxTransaction, StoreError};

#[derive(Debug, Default)]
struct State {
    outbox: HashMap<MessageId, OutboxMessage>,
    consumers: HashSet<InboxConsumerRecord>,
    rows: HashMap<String, BTreeMap<String, JsonValue>>,
    /// Outbox ids claimed by an open transaction.
    locked: HashSet<MessageId>,
    commit_failures: usize,
    consumer_inserts: u64,
}

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::storage("in-memory database lock poisoned"))
}

fn sort_for_delivery(messages: &mut [OutboxMessage]) {
    messages.sort_by(|a, b| {
        a.occurred_on_utc
            .cmp(&b.occurred_on_utc)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Rows that never failed first, then by delivery order.
fn sort_for_fetch(messages: &mut [OutboxMessage]) {
    sort_for_delivery(messages);
    messages.sort_by_key(|m| m.error.is_some());
}

/// Shared in-memory database. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail after the transaction's work was done.
    ///
    /// Simulates a crash between doing the work and making it durable: the
    /// staged writes are discarded as if the process died before commit.
    pub fn fail_next_commit(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.commit_failures += 1;
        }
    }

    /// All committed outbox messages in delivery order.
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        let mut messages: Vec<_> = self
            .state
            .lock()
            .map(|s| s.outbox.values().cloned().collect())
            .unwrap_or_default();
        sort_for_delivery(&mut messages);
        messages
    }

    pub fn outbox_message(&self, id: MessageId) -> Option<OutboxMessage> {
        self.state.lock().ok()?.outbox.get(&id).cloned()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.outbox.values().filter(|m| !m.is_processed()).count())
            .unwrap_or_default()
    }

    pub fn consumer_records(&self) -> Vec<InboxConsumerRecord> {
        self.state
            .lock()
            .map(|s| s.consumers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of consumer-record inserts attempted, including rejected ones.
    pub fn consumer_insert_attempts(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.consumer_inserts)
            .unwrap_or_default()
    }

    /// Committed business row.
    pub fn row(&self, table: &str, key: &str) -> Option<JsonValue> {
        self.state.lock().ok()?.rows.get(table)?.get(key).cloned()
    }

    /// Committed business rows of one table, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<(String, JsonValue)> {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.rows
                    .get(table)
                    .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutboxDatabase for InMemoryDatabase {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            new_messages: Vec::new(),
            dirty: HashMap::new(),
            new_consumers: Vec::new(),
            rows: HashMap::new(),
            locks: HashSet::new(),
            finished: false,
        })
    }
}

/// Open transaction on an [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    new_messages: Vec<OutboxMessage>,
    /// Staged versions of outbox rows updated in this transaction.
    dirty: HashMap<MessageId, OutboxMessage>,
    new_consumers: Vec<InboxConsumerRecord>,
    rows: HashMap<String, BTreeMap<String, JsonValue>>,
    locks: HashSet<MessageId>,
    finished: bool,
}

impl InMemoryTransaction {
    /// Stage a business row write.
    pub fn put_row(&mut self, table: &str, key: impl Into<String>, value: JsonValue) {
        self.rows
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Read a business row as seen by this transaction.
    pub fn get_row(&self, table: &str, key: &str) -> Result<Option<JsonValue>, StoreError> {
        if let Some(staged) = self.rows.get(table).and_then(|t| t.get(key)) {
            return Ok(Some(staged.clone()));
        }
        let state = lock(&self.state)?;
        Ok(state.rows.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn current(&self, state: &State, id: MessageId) -> Option<OutboxMessage> {
        self.dirty
            .get(&id)
            .or_else(|| self.new_messages.iter().find(|m| m.id == id))
            .or_else(|| state.outbox.get(&id))
            .cloned()
    }

    fn release_locks(&mut self, state: &mut State) {
        for id in self.locks.drain() {
            state.locked.remove(&id);
        }
    }

    fn update_unprocessed(
        &mut self,
        id: MessageId,
        apply: impl FnOnce(&mut OutboxMessage),
    ) -> Result<bool, StoreError> {
        let current = {
            let state = lock(&self.state)?;
            self.current(&state, id)
        };
        match current {
            Some(mut message) if !message.is_processed() => {
                apply(&mut message);
                self.dirty.insert(id, message);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OutboxTransaction for InMemoryTransaction {
    async fn insert_outbox_messages(&mut self, messages: &[OutboxMessage]) -> Result<(), StoreError> {
        let state = lock(&self.state)?;
        let mut seen: HashSet<MessageId> = self.new_messages.iter().map(|m| m.id).collect();
        for message in messages {
            if state.outbox.contains_key(&message.id) || !seen.insert(message.id) {
                return Err(StoreError::DuplicateMessage(message.id));
            }
        }
        drop(state);

        self.new_messages.extend(messages.iter().cloned());
        Ok(())
    }

    async fn fetch_unprocessed(&mut self, batch_size: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state_arc = Arc::clone(&self.state);
        let mut state = lock(&state_arc)?;

        let mut candidates: Vec<OutboxMessage> = state
            .outbox
            .keys()
            .filter(|id| !state.locked.contains(*id) || self.locks.contains(*id))
            .chain(self.new_messages.iter().map(|m| &m.id))
            .filter_map(|id| self.current(&state, *id))
            .filter(|m| !m.is_processed())
            .collect();
        sort_for_fetch(&mut candidates);
        candidates.truncate(batch_size);

        for message in &candidates {
            state.locked.insert(message.id);
            self.locks.insert(message.id);
        }
        Ok(candidates)
    }

    async fn outbox_message(&mut self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let state = lock(&self.state)?;
        Ok(self.current(&state, id))
    }

    async fn mark_processed(
        &mut self,
        id: MessageId,
        processed_on_utc: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update_unprocessed(id, |m| {
            m.processed_on_utc = Some(processed_on_utc);
            m.error = None;
        })
    }

    async fn record_error(&mut self, id: MessageId, error: &str) -> Result<bool, StoreError> {
        self.update_unprocessed(id, |m| m.error = Some(error.to_string()))
    }

    async fn consumer_exists(&mut self, record: &InboxConsumerRecord) -> Result<bool, StoreError> {
        let state = lock(&self.state)?;
        Ok(state.consumers.contains(record) || self.new_consumers.contains(record))
    }

    async fn insert_consumer(&mut self, record: &InboxConsumerRecord) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        state.consumer_inserts += 1;
        if state.consumers.contains(record) || self.new_consumers.contains(record) {
            return Err(StoreError::DuplicateConsumer {
                message_id: record.message_id,
                consumer_name: record.consumer_name.clone(),
            });
        }
        drop(state);

        self.new_consumers.push(record.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let state_arc = Arc::clone(&self.state);
        let mut state = lock(&state_arc)?;
        self.release_locks(&mut state);
        self.finished = true;

        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(StoreError::storage("commit failed: connection lost"));
        }

        // Constraints are checked against what committed since this
        // transaction staged its writes.
        for message in &self.new_messages {
            if state.outbox.contains_key(&message.id) {
                return Err(StoreError::DuplicateMessage(message.id));
            }
        }
        for record in &self.new_consumers {
            if state.consumers.contains(record) {
                return Err(StoreError::DuplicateConsumer {
                    message_id: record.message_id,
                    consumer_name: record.consumer_name.clone(),
                });
            }
        }

        for message in std::mem::take(&mut self.new_messages) {
            state.outbox.insert(message.id, message);
        }
        for (id, message) in std::mem::take(&mut self.dirty) {
            // Processed rows are immutable.
            if state.outbox.get(&id).is_some_and(|m| m.is_processed()) {
                continue;
            }
            state.outbox.insert(id, message);
        }
        state.consumers.extend(std::mem::take(&mut self.new_consumers));
        for (table, rows) in std::mem::take(&mut self.rows) {
            state.rows.entry(table).or_default().extend(rows);
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        let state_arc = Arc::clone(&self.state);
        let mut state = lock(&state_arc)?;
        self.release_locks(&mut state);
        self.finished = true;
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let state_arc = Arc::clone(&self.state);
        if let Ok(mut state) = state_arc.lock() {
            self.release_locks(&mut state);
        }
    }
}
