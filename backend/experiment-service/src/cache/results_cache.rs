use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::Granularity;

/// Short-TTL cache for computed experiment results.
///
/// The key digests every query parameter plus the experiment version, so an
/// activation or allocation change invalidates stale results automatically.
#[derive(Clone)]
pub struct ResultsCache {
    redis: ConnectionManager,
    ttl: Duration,
}

impl ResultsCache {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            redis,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cache_key(
        experiment_id: i64,
        version: i32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        event_types: Option<&[String]>,
        granularity: Granularity,
        min_sample: u64,
        include_ci: bool,
        property_filter: Option<&serde_json::Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(start.timestamp_millis().to_be_bytes());
        hasher.update(end.timestamp_millis().to_be_bytes());
        if let Some(types) = event_types {
            let mut sorted: Vec<&String> = types.iter().collect();
            sorted.sort();
            for t in sorted {
                hasher.update(t.as_bytes());
                hasher.update(b"\0");
            }
        }
        hasher.update(granularity.as_str().as_bytes());
        hasher.update(min_sample.to_be_bytes());
        hasher.update([include_ci as u8]);
        if let Some(filter) = property_filter {
            hasher.update(filter.to_string().as_bytes());
        }

        let digest = hex::encode(hasher.finalize());
        format!("results:v{}:exp:{}:{}", version, experiment_id, &digest[..32])
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(data)) => {
                debug!("Results cache HIT {}", key);
                Ok(serde_json::from_str(&data).ok())
            }
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::Cache(e.to_string())),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)
            .map_err(|e| AppError::Cache(format!("cache serialization error: {}", e)))?;

        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, data, self.ttl.as_secs())
            .await
            .map_err(|e| AppError::Cache(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn version_bump_changes_the_key() {
        let (start, end) = window();
        let a = ResultsCache::cache_key(7, 1, start, end, None, Granularity::Day, 100, true, None);
        let b = ResultsCache::cache_key(7, 2, start, end, None, Granularity::Day, 100, true, None);
        assert_ne!(a, b);
    }

    #[test]
    fn event_type_order_does_not_matter() {
        let (start, end) = window();
        let ab = vec!["a".to_string(), "b".to_string()];
        let ba = vec!["b".to_string(), "a".to_string()];
        let key_ab =
            ResultsCache::cache_key(7, 1, start, end, Some(&ab), Granularity::Day, 100, true, None);
        let key_ba =
            ResultsCache::cache_key(7, 1, start, end, Some(&ba), Granularity::Day, 100, true, None);
        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn every_parameter_is_significant() {
        let (start, end) = window();
        let base =
            ResultsCache::cache_key(7, 1, start, end, None, Granularity::Day, 100, true, None);

        let other_gran =
            ResultsCache::cache_key(7, 1, start, end, None, Granularity::Hour, 100, true, None);
        assert_ne!(base, other_gran);

        let other_sample =
            ResultsCache::cache_key(7, 1, start, end, None, Granularity::Day, 50, true, None);
        assert_ne!(base, other_sample);

        let filter = serde_json::json!({"plan": "pro"});
        let with_filter = ResultsCache::cache_key(
            7,
            1,
            start,
            end,
            None,
            Granularity::Day,
            100,
            true,
            Some(&filter),
        );
        assert_ne!(base, with_filter);
    }
}
