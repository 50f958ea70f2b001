//! # Buffer
//!
//! Size bounded accumulator owned by a single worker, flushed to a `BatchSink` as one atomic
//! write.
use async_trait::async_trait;
use thiserror::Error;

/// Records with a natural key. Writes are upserts on this key.
pub trait Keyed {
    fn key(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("storage write failed: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("storage rejected the batch: {0}")]
    Rejected(String),
}

/// Durable destination of a buffer.
///
/// `write_batch` must commit every record or none of them, and must be an upsert on the
/// records' natural key so that replays are harmless.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn write_batch(&self, records: &[T]) -> Result<(), FlushError>;
}

#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: Keyed> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(|i| i.key().to_owned()).collect()
    }

    /// Add a record, replacing any buffered record with the same key.
    ///
    /// Hands the record back when it would push the buffer past capacity, in which case the
    /// caller must flush first.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if let Some(existing) = self.items.iter_mut().find(|i| i.key() == item.key()) {
            *existing = item;
            return Ok(());
        }

        if self.is_full() {
            return Err(item);
        }

        self.items.push(item);
        Ok(())
    }

    /// Write the buffer to `sink` if it reached capacity, or unconditionally when `force` is set.
    ///
    /// On success the buffer is emptied and the written records are returned. On failure the
    /// buffer is left untouched so the same records are retried by the next flush. An empty
    /// buffer is never written.
    pub async fn flush<S>(&mut self, sink: &S, force: bool) -> Result<Vec<T>, FlushError>
    where
        S: BatchSink<T> + ?Sized,
    {
        if self.items.is_empty() || !(force || self.is_full()) {
            return Ok(Vec::new());
        }

        match sink.write_batch(&self.items).await {
            Ok(()) => {
                metrics::counter!("harvest_buffer_flushes_total").increment(1);
                metrics::histogram!("harvest_buffer_flush_size").record(self.items.len() as f64);
                Ok(std::mem::take(&mut self.items))
            }
            Err(error) => {
                metrics::counter!("harvest_buffer_flush_failures_total").increment(1);
                Err(error)
            }
        }
    }
}
