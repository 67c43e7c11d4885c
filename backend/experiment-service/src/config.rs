/// Configuration management for the experiment service.
///
/// This module handles loading and managing configuration from environment
/// variables.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// CORS configuration
    pub cors: CorsConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cache (Redis) configuration
    pub cache: CacheConfig,
    /// ClickHouse configuration
    pub clickhouse: ClickHouseConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Assignment engine settings
    pub assignment: AssignmentConfig,
    /// Analytics settings
    pub analytics: AnalyticsConfig,
    /// Outbox drainer settings
    pub outbox: OutboxConfig,
    /// Partition / retention settings
    pub retention: RetentionConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (dev, staging, prod)
    pub env: String,
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
    /// HTTP worker count
    pub workers: usize,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Comma-separated list of allowed origins
    pub allowed_origins: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    pub max_connections: u32,
}

/// Cache (Redis) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL
    pub url: String,
}

/// ClickHouse configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub query_timeout_ms: u64,
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    /// Topic prefix for outbox topics ("{prefix}.{aggregate_type}.events")
    pub topic_prefix: String,
    /// Consumer group for the rollup feed
    pub rollup_group_id: String,
}

/// Assignment engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Process-wide hash seed mixed into every bucket computation
    pub hash_seed: String,
    /// Bucket space N; allocation resolution is 1/N
    pub bucket_size: u32,
    /// Assignment cache TTL in seconds
    pub cache_ttl_secs: u64,
}

/// Analytics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Results cache TTL in seconds
    pub results_cache_ttl_secs: u64,
    /// Windows starting more than this many seconds ago route to ClickHouse
    pub recent_window_secs: i64,
    /// Windows wider than this many days route to ClickHouse
    pub max_operational_span_days: i64,
    /// Default minimum sample size for CI / p-value output
    pub default_min_sample: u64,
    /// Confidence level for intervals
    pub confidence: f64,
}

/// Outbox drainer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub batch_size: i64,
    pub poll_interval_ms: u64,
}

/// Partition / retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Event partitions entirely older than this are dropped once exported
    pub events_retention_days: i64,
    /// Monthly partitions to pre-create beyond the current one
    pub partitions_ahead: u32,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        Ok(Config {
            app: AppConfig {
                env: env_or("APP_ENV", "development"),
                host: env_or("EXPERIMENT_SERVICE_HOST", "0.0.0.0"),
                port: env_parse("EXPERIMENT_SERVICE_PORT", 8080),
                workers: env_parse("EXPERIMENT_SERVICE_WORKERS", 4),
            },
            cors: CorsConfig {
                allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "postgresql://localhost/experiments"),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 20),
            },
            cache: CacheConfig {
                url: env_or("REDIS_URL", "redis://localhost:6379"),
            },
            clickhouse: ClickHouseConfig {
                url: env_or("CLICKHOUSE_URL", "http://localhost:8123"),
                database: env_or("CLICKHOUSE_DATABASE", "experiments_analytics"),
                username: env_or("CLICKHOUSE_USER", "default"),
                password: env_or("CLICKHOUSE_PASSWORD", ""),
                query_timeout_ms: env_parse("CLICKHOUSE_QUERY_TIMEOUT_MS", 10_000),
            },
            kafka: KafkaConfig {
                brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
                topic_prefix: env_or("KAFKA_TOPIC_PREFIX", "experiments"),
                rollup_group_id: env_or("KAFKA_ROLLUP_GROUP_ID", "experiments-rollup-v1"),
            },
            assignment: AssignmentConfig {
                hash_seed: env_or("ASSIGNMENT_HASH_SEED", "default-seed-change-in-production"),
                bucket_size: env_parse("ASSIGNMENT_BUCKET_SIZE", 10_000),
                cache_ttl_secs: env_parse("ASSIGNMENT_CACHE_TTL", 604_800),
            },
            analytics: AnalyticsConfig {
                results_cache_ttl_secs: env_parse("RESULTS_CACHE_TTL", 60),
                recent_window_secs: env_parse("ANALYTICS_RECENT_WINDOW_SECS", 3_600),
                max_operational_span_days: env_parse("ANALYTICS_MAX_OPERATIONAL_SPAN_DAYS", 30),
                default_min_sample: env_parse("ANALYTICS_MIN_SAMPLE", 100),
                confidence: env_parse("ANALYTICS_CONFIDENCE", 0.95),
            },
            outbox: OutboxConfig {
                batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
                poll_interval_ms: env_parse("OUTBOX_POLL_INTERVAL_MS", 1_000),
            },
            retention: RetentionConfig {
                events_retention_days: env_parse("EVENTS_RETENTION_DAYS", 90),
                partitions_ahead: env_parse("EVENT_PARTITIONS_AHEAD", 3),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_env().unwrap();

        assert_eq!(config.assignment.bucket_size, 10_000);
        assert_eq!(config.assignment.cache_ttl_secs, 604_800);
        assert_eq!(config.analytics.results_cache_ttl_secs, 60);
        assert_eq!(config.analytics.recent_window_secs, 3_600);
        assert_eq!(config.analytics.max_operational_span_days, 30);
        assert_eq!(config.retention.events_retention_days, 90);
        assert_eq!(config.retention.partitions_ahead, 3);
    }
}
