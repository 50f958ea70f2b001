//! In-memory queue, item store and sink with the delivery and upsert semantics of the Postgres
//! implementations, for exercising stages without a database.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::buffer::{BatchSink, FlushError, Keyed};
use crate::queue::{Consumer, Delivery, Publisher, QueueError};
use crate::records::{EnrichmentRequest, SearchItem};
use crate::storage::{ItemStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    attempt: i32,
    payload: serde_json::Value,
}

#[derive(Default)]
struct QueueState {
    next_id: i64,
    available: VecDeque<StoredMessage>,
    in_flight: HashMap<i64, StoredMessage>,
    published: Vec<serde_json::Value>,
    completed: Vec<serde_json::Value>,
    rejected: Vec<(serde_json::Value, String)>,
    failing_publishes: usize,
}

impl QueueState {
    fn push(&mut self, payload: serde_json::Value) {
        self.next_id += 1;
        self.published.push(payload.clone());
        self.available.push_back(StoredMessage {
            id: self.next_id,
            attempt: 0,
            payload,
        });
    }

    fn requeue(&mut self, id: i64) {
        if let Some(message) = self.in_flight.remove(&id) {
            self.available.push_back(message);
            self.available.make_contiguous().sort_by_key(|m| m.id);
        }
    }
}

/// A named in-memory queue. Clones share the same messages.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    name: String,
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Default::default(),
        }
    }

    /// Enqueue an arbitrary payload, bypassing `EnrichmentRequest` serialization.
    pub fn push_raw(&self, payload: serde_json::Value) {
        lock(&self.state).push(payload);
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.state).failing_publishes = count;
    }

    /// Every payload ever enqueued, in order.
    pub fn published(&self) -> Vec<serde_json::Value> {
        lock(&self.state).published.clone()
    }

    pub fn completed(&self) -> Vec<serde_json::Value> {
        lock(&self.state).completed.clone()
    }

    pub fn rejected(&self) -> Vec<(serde_json::Value, String)> {
        lock(&self.state).rejected.clone()
    }

    pub fn available_count(&self) -> usize {
        lock(&self.state).available.len()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.state).in_flight.len()
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, request: &EnrichmentRequest) -> Result<(), QueueError> {
        let payload =
            serde_json::to_value(request).map_err(|error| QueueError::Serialization { error })?;

        let mut state = lock(&self.state);
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(QueueError::Unavailable(format!(
                "injected publish failure on {}",
                self.name
            )));
        }
        state.push(payload);
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryQueue {
    type Message = MemoryDelivery;

    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, _worker: &str) -> Result<Option<MemoryDelivery>, QueueError> {
        let mut state = lock(&self.state);
        let Some(mut message) = state.available.pop_front() else {
            return Ok(None);
        };
        message.attempt += 1;
        state.in_flight.insert(message.id, message.clone());

        Ok(Some(MemoryDelivery {
            message,
            state: self.state.clone(),
            finished: false,
        }))
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        Ok(lock(&self.state).available.len() as u64)
    }
}

/// Goes back to the queue when dropped without `ack` or `reject`.
pub struct MemoryDelivery {
    message: StoredMessage,
    state: Arc<Mutex<QueueState>>,
    finished: bool,
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.state).requeue(self.message.id);
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn id(&self) -> i64 {
        self.message.id
    }

    fn attempt(&self) -> i32 {
        self.message.attempt
    }

    fn payload(&self) -> &serde_json::Value {
        &self.message.payload
    }

    async fn ack(mut self) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        state.in_flight.remove(&self.message.id);
        state.completed.push(self.message.payload.clone());
        drop(state);
        self.finished = true;
        Ok(())
    }

    async fn reject(mut self, reason: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        state.in_flight.remove(&self.message.id);
        state
            .rejected
            .push((self.message.payload.clone(), reason.to_owned()));
        drop(state);
        self.finished = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredItem {
    pub item: SearchItem,
    pub partition_key: String,
    pub enqueued: bool,
}

#[derive(Default)]
pub struct MemoryItemStore {
    items: Mutex<HashMap<String, StoredItem>>,
    failing: AtomicBool,
}

impl MemoryItemStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<StoredItem> {
        lock(&self.items).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Query {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolClosed,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn record_items(
        &self,
        partition_key: &str,
        items: &[SearchItem],
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut stored = lock(&self.items);
        for item in items {
            let enqueued = stored.get(&item.id).is_some_and(|s| s.enqueued);
            stored.insert(
                item.id.clone(),
                StoredItem {
                    item: item.clone(),
                    partition_key: partition_key.to_owned(),
                    enqueued,
                },
            );
        }
        Ok(())
    }

    async fn mark_enqueued(&self, ids: &[String]) -> Result<(), StoreError> {
        self.check()?;
        let mut stored = lock(&self.items);
        for id in ids {
            if let Some(item) = stored.get_mut(id) {
                item.enqueued = true;
            }
        }
        Ok(())
    }

    async fn enqueued_among(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        self.check()?;
        let stored = lock(&self.items);
        Ok(ids
            .iter()
            .filter(|id| stored.get(*id).is_some_and(|s| s.enqueued))
            .cloned()
            .collect())
    }
}

/// Upserts records by key, optionally failing writes on demand.
pub struct MemorySink<T> {
    rows: Mutex<HashMap<String, T>>,
    writes: AtomicUsize,
    failed_writes: AtomicUsize,
    failures_remaining: AtomicUsize,
    failing: AtomicBool,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            failed_writes: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    /// Fail every write until turned off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        lock(&self.rows).get(key).cloned()
    }

    pub fn rows(&self) -> HashMap<String, T> {
        lock(&self.rows).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    /// Number of successful batch writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of batch writes that failed.
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T> BatchSink<T> for MemorySink<T>
where
    T: Keyed + Clone + Send + Sync,
{
    async fn write_batch(&self, records: &[T]) -> Result<(), FlushError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(FlushError::Rejected("injected write failure".to_owned()));
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(FlushError::Rejected("injected write failure".to_owned()));
        }

        let mut rows = lock(&self.rows);
        for record in records {
            rows.insert(record.key().to_owned(), record.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_delivery_returns_to_queue_in_order() {
        let queue = MemoryQueue::new("test");
        queue.publish(&EnrichmentRequest::new("1")).await.unwrap();
        queue.publish(&EnrichmentRequest::new("2")).await.unwrap();

        let first = queue.receive("w").await.unwrap().unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);
        drop(first);

        let again = queue.receive("w").await.unwrap().unwrap();
        assert_eq!(again.payload(), &serde_json::json!({"source_id": "1"}));
        assert_eq!(again.attempt(), 2);
        again.ack().await.unwrap();

        assert_eq!(queue.completed().len(), 1);
        assert_eq!(queue.in_flight_count(), 0);
    }
}
