/// Rollup feed: consumes `event.created` records from the bus and maintains
/// the analytical store.
///
/// Raw valid events land in the ClickHouse stream table; the materialized
/// view keeps `events_rollup` aggregated by (experiment, variant, day,
/// event type). Invalid (pre-assignment) events are skipped so the
/// analytical path never has to re-apply the post-assignment filter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::db::rollup_repo::{self, StreamRow};
use crate::db::ClickHouseClient;
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct RollupConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub batch_size: usize,
}

/// Redis-backed dedup for the at-least-once bus.
///
/// The drainer may deliver a record more than once; marking event ids with
/// SET NX keeps duplicates out of the rollup. A Redis failure fails open: the
/// event is treated as new, and the rollup stays recomputable from the events
/// table if that ever skews a count.
#[derive(Clone)]
pub struct EventDeduplicator {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl EventDeduplicator {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    /// Returns true when the event id is seen for the first time.
    pub async fn check_and_mark(&self, event_id: &str) -> bool {
        let key = format!("rollup:seen:{}", event_id);
        let mut conn = self.redis.clone();

        let outcome: std::result::Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await;

        match outcome {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Dedup check failed, treating event as new: {}", e);
                true
            }
        }
    }
}

/// The self-contained `event.created` payload written by the ingest path.
#[derive(Debug, Clone, Deserialize)]
struct EventPayload {
    id: String,
    experiment_id: i64,
    user_id: String,
    variant_id: Option<i64>,
    event_type: String,
    timestamp: DateTime<Utc>,
    is_valid: bool,
}

pub struct RollupConsumer {
    consumer: StreamConsumer,
    ch: Arc<ClickHouseClient>,
    deduplicator: EventDeduplicator,
    batch_size: usize,
}

impl RollupConsumer {
    pub fn new(
        config: RollupConsumerConfig,
        ch: Arc<ClickHouseClient>,
        deduplicator: EventDeduplicator,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create rollup consumer: {}", e);
                AppError::Unavailable(format!("Kafka consumer creation failed: {}", e))
            })?;

        consumer.subscribe(&[&config.topic]).map_err(|e| {
            error!("Failed to subscribe to {}: {}", config.topic, e);
            AppError::Unavailable(format!("Kafka subscribe failed: {}", e))
        })?;

        info!(topic = %config.topic, "Rollup consumer subscribed");

        Ok(Self {
            consumer,
            ch,
            deduplicator,
            batch_size: config.batch_size,
        })
    }

    /// Run the consume loop forever. Malformed or invalid payloads are
    /// skipped; insert failures are logged and retried with the next batch.
    pub async fn run(&self) {
        let mut batch: Vec<StreamRow> = Vec::with_capacity(self.batch_size);

        loop {
            match self.consumer.recv().await {
                Ok(msg) => {
                    if let Some(row) = Self::parse_message(msg.payload()) {
                        if self.deduplicator.check_and_mark(&row.event_id).await {
                            batch.push(row);
                        } else {
                            debug!(event_id = %row.event_id, "Skipping duplicate event");
                        }
                    }

                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
                Err(e) => {
                    error!("Rollup consumer error: {}", e);
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn parse_message(payload: Option<&[u8]>) -> Option<StreamRow> {
        let bytes = payload?;
        let event: EventPayload = match serde_json::from_slice(bytes) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed event payload: {}", e);
                return None;
            }
        };

        if !event.is_valid {
            debug!(event_id = %event.id, "Skipping pre-assignment event");
            return None;
        }
        let variant_id = event.variant_id?;

        Some(StreamRow {
            event_id: event.id,
            experiment_id: event.experiment_id,
            variant_id,
            user_id: event.user_id,
            event_type: event.event_type,
            day: event.timestamp.date_naive(),
        })
    }

    async fn flush(&self, batch: &mut Vec<StreamRow>) {
        if batch.is_empty() {
            return;
        }

        match rollup_repo::insert_stream_rows(&self.ch, batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "Flushed rollup rows");
                batch.clear();
            }
            Err(e) => {
                // Keep the batch; the next flush retries. The rollup stays
                // recomputable from the events table if an ambiguous failure
                // ever double-inserts.
                error!("Rollup insert failed, will retry: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_events_are_skipped() {
        let payload = serde_json::json!({
            "id": "4a7f6c1e-0000-0000-0000-000000000001",
            "experiment_id": 7,
            "user_id": "user_42",
            "variant_id": 3,
            "event_type": "conversion",
            "timestamp": "2025-06-01T12:00:00Z",
            "assignment_at": "2025-06-01T12:00:01Z",
            "is_valid": false
        })
        .to_string();

        assert!(RollupConsumer::parse_message(Some(payload.as_bytes())).is_none());
    }

    #[test]
    fn valid_events_become_stream_rows() {
        let payload = serde_json::json!({
            "id": "4a7f6c1e-0000-0000-0000-000000000001",
            "experiment_id": 7,
            "user_id": "user_42",
            "variant_id": 3,
            "event_type": "conversion",
            "timestamp": "2025-06-01T12:00:00Z",
            "is_valid": true
        })
        .to_string();

        let row = RollupConsumer::parse_message(Some(payload.as_bytes())).unwrap();
        assert_eq!(row.experiment_id, 7);
        assert_eq!(row.variant_id, 3);
        assert_eq!(row.day.to_string(), "2025-06-01");
    }

    #[test]
    fn events_without_a_variant_are_skipped() {
        let payload = serde_json::json!({
            "id": "4a7f6c1e-0000-0000-0000-000000000001",
            "experiment_id": 7,
            "user_id": "user_42",
            "variant_id": null,
            "event_type": "conversion",
            "timestamp": "2025-06-01T12:00:00Z",
            "is_valid": true
        })
        .to_string();

        assert!(RollupConsumer::parse_message(Some(payload.as_bytes())).is_none());
    }

    #[test]
    fn garbage_payloads_are_skipped() {
        assert!(RollupConsumer::parse_message(Some(b"not json")).is_none());
        assert!(RollupConsumer::parse_message(None).is_none());
    }
}
