//! # Queue
//!
//! At-least-once message queue operations the stages are written against. A delivery that is
//! dropped without being acknowledged is delivered again.
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::records::EnrichmentRequest;

/// Errors that can originate from the queue backend, wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreation { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    Connection { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("could not serialize jsonb field: {error}")]
    Serialization { error: serde_json::Error },
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Durably enqueue `request`. Once this returns `Ok` the message survives a broker restart.
    async fn publish(&self, request: &EnrichmentRequest) -> Result<(), QueueError>;
}

/// A message handed to exactly one worker until it is acknowledged, rejected or dropped.
#[async_trait]
pub trait Delivery: Send {
    fn id(&self) -> i64;

    /// How many times this message has been delivered, this delivery included.
    fn attempt(&self) -> i32;

    fn payload(&self) -> &serde_json::Value;

    /// The message was handled and must not be delivered again.
    async fn ack(self) -> Result<(), QueueError>;

    /// The message can never be handled. It is kept with `reason` for inspection and not
    /// delivered again.
    async fn reject(self, reason: &str) -> Result<(), QueueError>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    type Message: Delivery + 'static;

    fn name(&self) -> &str;

    /// Take at most one available message, or `None` if there is nothing to deliver.
    async fn receive(&self, worker: &str) -> Result<Option<Self::Message>, QueueError>;

    /// Approximate number of messages waiting to be delivered, excluding those in flight.
    async fn pending(&self) -> Result<u64, QueueError>;
}

/// Publish `request`, retrying failed publishes under `policy`.
pub async fn publish_with_backoff<P: Publisher + ?Sized>(
    publisher: &P,
    request: &EnrichmentRequest,
    policy: &BackoffPolicy,
) -> Result<(), QueueError> {
    let mut attempt = 0;
    loop {
        match publisher.publish(request).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.base_interval(attempt - 1);
                warn!(
                    source_id = %request.source_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "publish failed: {}", e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
