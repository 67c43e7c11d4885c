use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::warn;

/// Non-authoritative realtime counters updated on the event hot path.
///
/// Hourly event counts plus a per-day HyperLogLog of unique users. Every
/// operation is best-effort: a Redis failure is logged and the request
/// proceeds.
#[derive(Clone)]
pub struct RealtimeCounters {
    redis: ConnectionManager,
}

// Keep hourly counters just past a day, HLLs for two days.
const HOURLY_TTL_SECS: i64 = 90_000;
const DAILY_TTL_SECS: i64 = 172_800;

impl RealtimeCounters {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn hourly_key(
        experiment_id: i64,
        variant_id: i64,
        event_type: &str,
        timestamp: DateTime<Utc>,
    ) -> String {
        format!(
            "metrics:{}:{}:{}:{}",
            experiment_id,
            variant_id,
            event_type,
            timestamp.format("%Y%m%d%H")
        )
    }

    fn unique_key(
        experiment_id: i64,
        variant_id: i64,
        event_type: &str,
        timestamp: DateTime<Utc>,
    ) -> String {
        format!(
            "unique:{}:{}:{}:{}",
            experiment_id,
            variant_id,
            event_type,
            timestamp.format("%Y%m%d")
        )
    }

    pub async fn record(
        &self,
        experiment_id: i64,
        variant_id: i64,
        event_type: &str,
        user_id: &str,
        timestamp: DateTime<Utc>,
    ) {
        let hourly = Self::hourly_key(experiment_id, variant_id, event_type, timestamp);
        let unique = Self::unique_key(experiment_id, variant_id, event_type, timestamp);

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("INCR").arg(&hourly).ignore();
        pipe.cmd("EXPIRE").arg(&hourly).arg(HOURLY_TTL_SECS).ignore();
        pipe.cmd("PFADD").arg(&unique).arg(user_id).ignore();
        pipe.cmd("EXPIRE").arg(&unique).arg(DAILY_TTL_SECS).ignore();

        if let Err(e) = pipe.query_async::<_, ()>(&mut conn).await {
            warn!("Realtime counter update failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counter_keys_bucket_by_hour_and_day() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        assert_eq!(
            RealtimeCounters::hourly_key(7, 3, "conversion", ts),
            "metrics:7:3:conversion:2025060114"
        );
        assert_eq!(
            RealtimeCounters::unique_key(7, 3, "conversion", ts),
            "unique:7:3:conversion:20250601"
        );
    }
}
