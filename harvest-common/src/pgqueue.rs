//! # PgQueue
//!
//! A message queue backed by a PostgreSQL table shared by every named queue.
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use tracing::debug;

use crate::queue::{Consumer, Delivery, Publisher, QueueError};
use crate::records::EnrichmentRequest;

/// Connect a pool to the database in `url`, failing if it cannot be reached.
pub async fn connect_pool(
    url: &str,
    max_connections: u32,
    app_name: &'static str,
) -> Result<PgPool, QueueError> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|error| QueueError::PoolCreation { error })?
        .application_name(app_name);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|error| QueueError::Connection { error })
}

/// A row of `job_queue` as seen by a worker.
#[derive(sqlx::FromRow, Debug)]
pub struct QueuedMessage {
    pub id: i64,
    /// A number corresponding to the current delivery attempt.
    pub attempt: i32,
    /// Workers that have received this message.
    pub attempted_by: Vec<String>,
    pub parameters: sqlx::types::Json<serde_json::Value>,
    pub queue: String,
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A name to identify this PgQueue as multiple share a table.
    name: String,
    pool: PgPool,
}

impl PgQueue {
    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> PgQueue {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }
}

#[async_trait]
impl Publisher for PgQueue {
    async fn publish(&self, request: &EnrichmentRequest) -> Result<(), QueueError> {
        let parameters =
            serde_json::to_value(request).map_err(|error| QueueError::Serialization { error })?;

        let base_query = r#"
INSERT INTO job_queue
    (attempt, created_at, parameters, queue, status)
VALUES
    (0, NOW(), $1, $2, 'available'::job_status)
        "#;

        sqlx::query(base_query)
            .bind(&parameters)
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "INSERT".to_owned(),
                error,
            })?;

        metrics::counter!("harvest_queue_published_total", "queue" => self.name.clone())
            .increment(1);

        Ok(())
    }
}

#[async_trait]
impl Consumer for PgQueue {
    type Message = PgDelivery;

    fn name(&self) -> &str {
        &self.name
    }

    /// Lock one available message and hold the transaction until the delivery is finished.
    /// Any other `receive` calls skip locked rows, so only one worker holds a given message.
    /// Dropping the delivery rolls the transaction back, making the message available again.
    async fn receive(&self, worker: &str) -> Result<Option<PgDelivery>, QueueError> {
        let mut txn = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::Connection { error })?;

        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        job_queue
    WHERE
        status = 'available'
        AND queue = $1
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    job_queue
SET
    attempted_at = NOW(),
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $2::text)
FROM
    available_in_queue
WHERE
    job_queue.id = available_in_queue.id
RETURNING
    job_queue.id,
    job_queue.attempt,
    job_queue.attempted_by,
    job_queue.parameters,
    job_queue.queue
        "#;

        let message: Option<QueuedMessage> = sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(worker)
            .fetch_optional(&mut *txn)
            .await
            .map_err(|error| QueueError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        // Transaction is rolled back on drop.
        Ok(message.map(|message| {
            debug!(
                queue = %self.name,
                id = message.id,
                attempt = message.attempt,
                worker,
                "received message"
            );
            PgDelivery { message, txn }
        }))
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        // Rows held by an open delivery are still 'available' to other sessions, skip them.
        let base_query = r#"
SELECT
    COUNT(*)
FROM (
    SELECT
        id
    FROM
        job_queue
    WHERE
        status = 'available'
        AND queue = $1
    FOR KEY SHARE SKIP LOCKED
) AS undelivered
        "#;

        let count: i64 = sqlx::query_scalar(base_query)
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| QueueError::Query {
                command: "SELECT".to_owned(),
                error,
            })?;

        metrics::gauge!("harvest_queue_depth", "queue" => self.name.clone()).set(count as f64);

        Ok(count.max(0) as u64)
    }
}

/// A message within an open PostgreSQL transaction.
#[derive(Debug)]
pub struct PgDelivery {
    pub message: QueuedMessage,
    txn: Transaction<'static, Postgres>,
}

impl PgDelivery {
    async fn finish(
        self,
        base_query: &str,
        error: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let PgDelivery { message, mut txn } = self;

        let mut query = sqlx::query(base_query)
            .bind(&message.queue)
            .bind(message.id);
        if let Some(error) = error {
            query = query.bind(sqlx::types::Json(error));
        }

        query
            .execute(&mut *txn)
            .await
            .map_err(|error| QueueError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;

        txn.commit().await.map_err(|error| QueueError::Query {
            command: "COMMIT".to_owned(),
            error,
        })
    }
}

#[async_trait]
impl Delivery for PgDelivery {
    fn id(&self) -> i64 {
        self.message.id
    }

    fn attempt(&self) -> i32 {
        self.message.attempt
    }

    fn payload(&self) -> &serde_json::Value {
        &self.message.parameters.0
    }

    async fn ack(self) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE
    job_queue
SET
    finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
        "#;

        self.finish(base_query, None).await
    }

    async fn reject(self, reason: &str) -> Result<(), QueueError> {
        let base_query = r#"
UPDATE
    job_queue
SET
    finished_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
        "#;

        let error = serde_json::json!({ "reason": reason });
        self.finish(base_query, Some(error)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Use process id as a worker id for tests.
    fn worker_id() -> String {
        std::process::id().to_string()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_can_receive_published_message(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_can_receive_published_message", db);
        let worker_id = worker_id();

        queue
            .publish(&EnrichmentRequest::new("42"))
            .await
            .expect("failed to publish");

        let delivery = queue
            .receive(&worker_id)
            .await
            .expect("failed to receive")
            .expect("didn't find a message to receive");

        assert_eq!(delivery.attempt(), 1);
        assert_eq!(delivery.message.attempted_by, vec![worker_id.clone()]);
        assert_eq!(delivery.payload(), &serde_json::json!({"source_id": "42"}));

        delivery.ack().await.expect("failed to ack");

        assert!(queue.receive(&worker_id).await.unwrap().is_none());
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dropped_delivery_is_redelivered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_dropped_delivery_is_redelivered", db);
        let worker_id = worker_id();

        queue.publish(&EnrichmentRequest::new("7")).await.unwrap();

        let delivery = queue.receive(&worker_id).await.unwrap().unwrap();
        drop(delivery);

        let redelivered = queue.receive(&worker_id).await.unwrap().unwrap();
        assert_eq!(redelivered.payload(), &serde_json::json!({"source_id": "7"}));
        redelivered.ack().await.unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_in_flight_message_is_hidden_from_other_workers(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_in_flight_message_is_hidden", db);

        queue.publish(&EnrichmentRequest::new("1")).await.unwrap();
        queue.publish(&EnrichmentRequest::new("2")).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 2);

        let first = queue.receive("worker-1").await.unwrap().unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);

        let second = queue.receive("worker-2").await.unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(queue.receive("worker-3").await.unwrap().is_none());
        assert_eq!(queue.pending().await.unwrap(), 0);

        first.ack().await.unwrap();
        second.ack().await.unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_rejected_message_is_not_redelivered(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_rejected_message", db.clone());
        let worker_id = worker_id();

        queue.publish(&EnrichmentRequest::new("9")).await.unwrap();
        let delivery = queue.receive(&worker_id).await.unwrap().unwrap();
        let id = delivery.id();
        delivery.reject("missing source id").await.unwrap();

        assert!(queue.receive(&worker_id).await.unwrap().is_none());

        let status: String =
            sqlx::query_scalar("SELECT status::text FROM job_queue WHERE id = $1")
                .bind(id)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(status, "failed");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_queues_sharing_a_table_are_isolated(db: PgPool) {
        let profiles = PgQueue::new_from_pool("profile_requests", db.clone());
        let details = PgQueue::new_from_pool("detail_requests", db);

        profiles.publish(&EnrichmentRequest::new("1")).await.unwrap();

        assert_eq!(details.pending().await.unwrap(), 0);
        assert!(details.receive("worker").await.unwrap().is_none());
        assert_eq!(profiles.pending().await.unwrap(), 1);
    }
}
