use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::AssignmentView;

/// Read-through cache for sticky assignments.
///
/// Keys are versioned (`assign:v1:...`) so a cache schema change never
/// produces stale hits. The store stays the source of truth: every caller
/// treats a cache failure as a miss.
#[derive(Clone)]
pub struct AssignmentCache {
    redis: ConnectionManager,
    default_ttl: Duration,
}

impl AssignmentCache {
    pub fn new(redis: ConnectionManager, default_ttl_secs: u64) -> Self {
        Self {
            redis,
            default_ttl: Duration::from_secs(default_ttl_secs),
        }
    }

    fn key(experiment_id: i64, user_id: &str) -> String {
        format!("assign:v1:exp:{}:user:{}", experiment_id, user_id)
    }

    fn experiment_pattern(experiment_id: i64) -> String {
        format!("assign:v1:exp:{}:user:*", experiment_id)
    }

    pub async fn get(&self, experiment_id: i64, user_id: &str) -> Result<Option<AssignmentView>> {
        let key = Self::key(experiment_id, user_id);
        let mut conn = self.redis.clone();

        match conn.get::<_, Option<String>>(&key).await {
            Ok(Some(data)) => {
                debug!("Assignment cache HIT exp={} user={}", experiment_id, user_id);
                serde_json::from_str::<AssignmentView>(&data)
                    .map(Some)
                    .map_err(|e| AppError::Cache(format!("cache deserialization error: {}", e)))
            }
            Ok(None) => {
                debug!("Assignment cache MISS exp={} user={}", experiment_id, user_id);
                Ok(None)
            }
            Err(e) => Err(AppError::Cache(e.to_string())),
        }
    }

    pub async fn set(&self, view: &AssignmentView) -> Result<()> {
        let key = Self::key(view.experiment_id, &view.user_id);
        let data = serde_json::to_string(view)
            .map_err(|e| AppError::Cache(format!("cache serialization error: {}", e)))?;

        // Jitter the TTL so a burst of fills does not expire in lockstep.
        let jitter_secs = rand::random::<u64>() % 300;
        let ttl = self.default_ttl.as_secs() + jitter_secs;

        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(&key, data, ttl)
            .await
            .map_err(|e| AppError::Cache(e.to_string()))
    }

    /// One round-trip multi-get; results align with `experiment_ids`.
    pub async fn get_many(
        &self,
        user_id: &str,
        experiment_ids: &[i64],
    ) -> Result<Vec<Option<AssignmentView>>> {
        if experiment_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = experiment_ids
            .iter()
            .map(|id| Self::key(*id, user_id))
            .collect();

        let mut conn = self.redis.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Cache(e.to_string()))?;

        Ok(values
            .into_iter()
            .map(|value| value.and_then(|data| serde_json::from_str(&data).ok()))
            .collect())
    }

    pub async fn set_many(&self, views: &[AssignmentView]) -> Result<()> {
        let mut conn = self.redis.clone();
        let ttl = self.default_ttl.as_secs();

        let mut pipe = redis::pipe();
        for view in views {
            let key = Self::key(view.experiment_id, &view.user_id);
            if let Ok(data) = serde_json::to_string(view) {
                pipe.cmd("SET").arg(&key).arg(data).arg("EX").arg(ttl).ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| AppError::Cache(e.to_string()))
    }

    pub async fn delete(&self, experiment_id: i64, user_id: &str) -> Result<()> {
        let key = Self::key(experiment_id, user_id);
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&key)
            .await
            .map_err(|e| AppError::Cache(e.to_string()))
    }

    /// Drop every cached assignment of an experiment.
    ///
    /// Called by the lifecycle on version bumps and allocation edits. SCAN in
    /// batches so large experiments never block Redis; a failure here only
    /// shortens cache freshness, persisted assignments are unaffected.
    pub async fn invalidate_experiment(&self, experiment_id: i64) -> Result<u64> {
        let pattern = Self::experiment_pattern(experiment_id);
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| AppError::Cache(e.to_string()))?;

            if !keys.is_empty() {
                let removed: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| AppError::Cache(e.to_string()))?;
                deleted += removed;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if deleted > 0 {
            warn!(
                experiment_id,
                deleted, "Invalidated cached assignments after experiment change"
            );
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_a_schema_version() {
        assert_eq!(
            AssignmentCache::key(7, "user_42"),
            "assign:v1:exp:7:user:user_42"
        );
    }

    #[test]
    fn invalidation_pattern_scopes_one_experiment() {
        assert_eq!(
            AssignmentCache::experiment_pattern(7),
            "assign:v1:exp:7:user:*"
        );
    }
}
