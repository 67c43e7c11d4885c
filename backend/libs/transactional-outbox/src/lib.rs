//! # Transactional Outbox
//!
//! Implements the transactional outbox pattern for reliable change-data-capture:
//! domain rows and their outbox records are written in the same database
//! transaction, and a background drainer publishes pending records to Kafka
//! with at-least-once semantics.
//!
//! ## Guarantees
//!
//! 1. A committed domain write and its outbox record are atomic: both exist or
//!    neither does.
//! 2. Records are drained in `id` order. Because `id` is a `BIGSERIAL` and the
//!    bus partitions by `aggregate_id`, consumers observe per-aggregate order.
//! 3. `processed_at` is set only after the bus acknowledges the record, so a
//!    crash between publish and commit re-delivers; consumers must be
//!    idempotent on `(aggregate_type, aggregate_id, event_type, id)`.
//! 4. Concurrent drainers are safe without coordination: the lease query uses
//!    `FOR UPDATE SKIP LOCKED`, so each worker sees a disjoint slice and a
//!    crashed worker's slice returns to pending when its lock is released.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{NewOutboxRecord, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//!
//! async fn create_assignment(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("INSERT INTO assignments (experiment_id, user_id) VALUES ($1, $2)")
//!         .bind(7_i64)
//!         .bind("user_42")
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     outbox
//!         .insert(
//!             &mut tx,
//!             &NewOutboxRecord::new(
//!                 "assignment",
//!                 "7:user_42",
//!                 "assignment.created",
//!                 serde_json::json!({ "experiment_id": 7, "user_id": "user_42" }),
//!             ),
//!         )
//!         .await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod error;
pub mod macros;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};
pub use metrics::OutboxMetrics;

/// A record pending insertion into the outbox table.
///
/// The database assigns the monotonically increasing `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxRecord {
    /// Kind of aggregate the record describes ("assignment", "event")
    pub aggregate_type: String,

    /// Identity of the aggregate; also the bus partition key
    pub aggregate_id: String,

    /// Fully qualified event type (e.g. "assignment.created")
    pub event_type: String,

    /// Self-contained payload: consumers never re-read domain tables
    pub payload: serde_json::Value,
}

impl NewOutboxRecord {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonically increasing identifier; drives per-aggregate ordering
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, after the bus acknowledges the record
    pub processed_at: Option<DateTime<Utc>>,
}

impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for OutboxRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

/// Repository trait for outbox persistence.
///
/// `insert` MUST be called inside the same transaction as the domain write it
/// describes; `lease` and `mark_processed` MUST share one transaction so that
/// a crash mid-batch releases the row locks and returns the slice to pending.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a record inside an existing transaction. Returns the assigned id.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &NewOutboxRecord,
    ) -> OutboxResult<i64>;

    /// Lease up to `limit` pending records in id order, skipping rows locked
    /// by other drainers.
    async fn lease(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    /// Mark the given ids as processed within the leasing transaction.
    async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[i64],
    ) -> OutboxResult<u64>;

    /// Pending count and oldest pending age in seconds (0 when none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of [`OutboxRepository`] backed by PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count pending records created at or before `cutoff`.
    ///
    /// Retention uses this to refuse dropping event partitions that have not
    /// yet been exported downstream.
    pub async fn pending_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<i64> {
        let rec = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS pending
            FROM outbox_events
            WHERE processed_at IS NULL
              AND created_at <= $1
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(rec.try_get("pending").unwrap_or(0))
    }

    /// Insert a batch of records with one set-oriented statement, inside the
    /// caller's transaction.
    pub async fn insert_many(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        records: &[NewOutboxRecord],
    ) -> OutboxResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder: sqlx::QueryBuilder<Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO outbox_events (aggregate_type, aggregate_id, event_type, payload) ",
        );

        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.aggregate_type)
                .push_bind(&record.aggregate_id)
                .push_bind(&record.event_type)
                .push_bind(&record.payload);
        });

        let res = builder.build().execute(&mut **tx).await?;
        Ok(res.rows_affected())
    }

    /// Reset records created since `ts` to pending for operational backfill.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    /// Reset records by id range (inclusive) to pending.
    pub async fn replay_range(&self, from_id: i64, to_id: i64) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &NewOutboxRecord,
    ) -> OutboxResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events (aggregate_type, aggregate_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .fetch_one(&mut **tx)
        .await?;

        let id: i64 = row.try_get("id")?;

        debug!(
            outbox_id = id,
            event_type = %record.event_type,
            aggregate_id = %record.aggregate_id,
            "Record inserted into outbox"
        );

        Ok(id)
    }

    async fn lease(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   created_at, processed_at
            FROM outbox_events
            WHERE processed_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        debug!(count = records.len(), "Leased pending outbox records");

        Ok(records)
    }

    async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[i64],
    ) -> OutboxResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NOW()
            WHERE id = ANY($1)
              AND processed_at IS NULL
            "#,
        )
        .bind(ids)
        .execute(&mut **tx)
        .await?;

        Ok(res.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publisher trait for delivering outbox records to an external bus.
///
/// Implementations should be idempotent-friendly: at-least-once delivery
/// means the same record may be published more than once.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()>;
}

/// Kafka-based implementation of [`OutboxPublisher`].
///
/// One logical topic per aggregate type; `aggregate_id` is the partition key
/// so all records for one aggregate land on the same ordered stream.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    delivery_timeout: Duration,
}

impl KafkaOutboxPublisher {
    /// The producer MUST be configured with `enable.idempotence=true` and
    /// `acks=all`.
    pub fn new(producer: FutureProducer, topic_prefix: String) -> Self {
        Self {
            producer,
            topic_prefix,
            delivery_timeout: Duration::from_secs(5),
        }
    }

    /// Map an aggregate type to its topic, e.g. "assignment" ->
    /// "exp.assignment.events".
    fn get_topic(&self, aggregate_type: &str) -> String {
        format!("{}.{}.events", self.topic_prefix, aggregate_type)
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let topic = self.get_topic(&record.aggregate_type);

        let payload_str = serde_json::to_string(&record.payload)?;

        let record_id_str = record.id.to_string();
        let created_at_str = record.created_at.to_rfc3339();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(record.event_type.as_bytes()),
            })
            .insert(Header {
                key: "outbox_id",
                value: Some(record_id_str.as_bytes()),
            })
            .insert(Header {
                key: "aggregate_type",
                value: Some(record.aggregate_type.as_bytes()),
            })
            .insert(Header {
                key: "created_at",
                value: Some(created_at_str.as_bytes()),
            });

        let kafka_record = FutureRecord::to(&topic)
            .key(&record.aggregate_id)
            .payload(&payload_str)
            .headers(headers);

        self.producer
            .send(kafka_record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| {
                OutboxError::PublishFailed(format!("Kafka publish failed: {}", err))
            })?;

        debug!(
            outbox_id = record.id,
            event_type = %record.event_type,
            topic = %topic,
            "Record published to bus"
        );

        Ok(())
    }
}

/// Background drainer that publishes pending outbox records.
///
/// Each cycle opens one transaction, leases a batch with `SKIP LOCKED`,
/// publishes records in id order, marks the published prefix as processed and
/// commits. A publish failure stops the batch at that record so per-aggregate
/// order is preserved; the unpublished suffix stays pending and the next
/// lease retries it. No retry counter is kept: lease contention is the
/// backoff.
pub struct OutboxDrainer<R: OutboxRepository, P: OutboxPublisher> {
    pool: PgPool,
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i64,
    poll_interval: Duration,
    metrics: Option<OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxDrainer<R, P> {
    pub fn new(
        pool: PgPool,
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            repository,
            publisher,
            batch_size,
            poll_interval,
            metrics: None,
        }
    }

    /// Create a drainer that also updates Prometheus gauges each cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the drain loop forever. Spawn as a background task; all errors are
    /// logged and the loop continues.
    pub async fn start(&self) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox drainer starting"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            ticker.tick().await;

            match self.drain_once().await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "Drained outbox records");
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc_by(count as u64);
                        }
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Outbox drain cycle failed");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }
        }
    }

    /// Drain a single batch. Returns the number of records acknowledged.
    pub async fn drain_once(&self) -> OutboxResult<usize> {
        let mut tx = self.pool.begin().await?;

        let batch = self.repository.lease(&mut tx, self.batch_size).await?;
        if batch.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut published: Vec<i64> = Vec::with_capacity(batch.len());

        for record in &batch {
            match self.publisher.publish(record).await {
                Ok(()) => published.push(record.id),
                Err(e) => {
                    // Stop at the first failure: publishing later ids for the
                    // same aggregate would break per-key ordering.
                    warn!(
                        outbox_id = record.id,
                        event_type = %record.event_type,
                        error = %e,
                        "Publish failed, leaving record and successors pending"
                    );
                    break;
                }
            }
        }

        if published.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        self.repository.mark_processed(&mut tx, &published).await?;
        tx.commit().await?;

        Ok(published.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_mapping_is_per_aggregate_type() {
        let producer: FutureProducer = rdkafka::ClientConfig::new()
            .create()
            .expect("producer without brokers is still constructible");
        let publisher = KafkaOutboxPublisher::new(producer, "exp".to_string());

        assert_eq!(publisher.get_topic("assignment"), "exp.assignment.events");
        assert_eq!(publisher.get_topic("event"), "exp.event.events");
    }

    #[test]
    fn new_record_is_self_contained() {
        let record = NewOutboxRecord::new(
            "assignment",
            "7:user_42",
            "assignment.created",
            serde_json::json!({ "experiment_id": 7, "user_id": "user_42", "variant_id": 3 }),
        );

        assert_eq!(record.aggregate_type, "assignment");
        assert_eq!(record.aggregate_id, "7:user_42");
        assert_eq!(record.payload["variant_id"], 3);
    }
}
