/// Monthly event partition management and retention.
///
/// On startup and on a daily tick the manager makes sure the current month
/// plus a few months ahead exist with their secondary indexes, and drops
/// partitions past the retention cutoff. A partition is only dropped once the
/// outbox holds no unprocessed record at or before its upper bound: export
/// before drop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use sqlx::PgPool;
use tracing::{error, info, warn};
use transactional_outbox::SqlxOutboxRepository;

use crate::error::{AppError, Result};

pub struct PartitionManager {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
    retention_days: i64,
    partitions_ahead: u32,
}

/// `events_y2025m06` style child table name.
fn partition_name(year: i32, month: u32) -> String {
    format!("events_y{:04}m{:02}", year, month)
}

fn parse_partition_name(name: &str) -> Option<(i32, u32)> {
    let rest = name.strip_prefix("events_y")?;
    let (year_str, month_str) = rest.split_once('m')?;
    let year: i32 = year_str.parse().ok()?;
    let month: u32 = month_str.parse().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}

fn add_months(year: i32, month: u32, offset: u32) -> (i32, u32) {
    let total = year * 12 + (month as i32 - 1) + offset as i32;
    (total.div_euclid(12), (total.rem_euclid(12) + 1) as u32)
}

/// Inclusive lower and exclusive upper day of a month.
fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let (next_year, next_month) = add_months(year, month, 1);
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
    Some((start, end))
}

impl PartitionManager {
    pub fn new(
        pool: PgPool,
        outbox: Arc<SqlxOutboxRepository>,
        retention_days: i64,
        partitions_ahead: u32,
    ) -> Self {
        Self {
            pool,
            outbox,
            retention_days,
            partitions_ahead,
        }
    }

    /// Run forever: one maintenance pass immediately, then daily.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));

        loop {
            ticker.tick().await;

            if let Err(e) = self.ensure_partitions().await {
                error!("Partition creation failed: {}", e);
            }
            if let Err(e) = self.apply_retention().await {
                error!("Partition retention failed: {}", e);
            }
        }
    }

    /// Create the current month plus `partitions_ahead` future months.
    pub async fn ensure_partitions(&self) -> Result<()> {
        let today = Utc::now().date_naive();

        for offset in 0..=self.partitions_ahead {
            let (year, month) = add_months(today.year(), today.month(), offset);
            self.create_partition(year, month).await?;
        }

        Ok(())
    }

    async fn create_partition(&self, year: i32, month: u32) -> Result<()> {
        let name = partition_name(year, month);
        let (start, end) = month_bounds(year, month)
            .ok_or_else(|| AppError::Internal(format!("invalid partition month {}-{}", year, month)))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF events \
             FOR VALUES FROM ('{}') TO ('{}')",
            name, start, end
        ))
        .execute(&self.pool)
        .await?;

        for (suffix, columns, using) in [
            ("experiment_time", "(experiment_id, timestamp)", ""),
            ("user_time", "(user_id, timestamp)", ""),
            ("type_time", "(event_type, timestamp)", ""),
            ("properties", "(properties)", " USING gin"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {}{} {}",
                name, suffix, name, using, columns
            ))
            .execute(&self.pool)
            .await?;
        }

        info!(partition = %name, "Event partition ensured");
        Ok(())
    }

    /// Drop partitions entirely older than the retention cutoff, refusing any
    /// whose window the outbox has not finished exporting.
    pub async fn apply_retention(&self) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        let mut dropped = 0;

        for name in self.list_partitions().await? {
            let Some((year, month)) = parse_partition_name(&name) else {
                continue;
            };
            let Some((_, upper)) = month_bounds(year, month) else {
                continue;
            };
            let Some(upper_midnight) = upper.and_hms_opt(0, 0, 0) else {
                continue;
            };
            let upper_ts = Utc.from_utc_datetime(&upper_midnight);

            if upper_ts > cutoff {
                continue;
            }

            let pending = self.outbox.pending_before(upper_ts).await?;
            if pending > 0 {
                warn!(
                    partition = %name,
                    pending,
                    "Skipping partition drop: outbox export incomplete"
                );
                continue;
            }

            sqlx::query(&format!("DROP TABLE IF EXISTS {}", name))
                .execute(&self.pool)
                .await?;
            info!(partition = %name, "Dropped expired event partition");
            dropped += 1;
        }

        Ok(dropped)
    }

    async fn list_partitions(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT c.relname
            FROM pg_inherits i
            JOIN pg_class c ON c.oid = i.inhrelid
            JOIN pg_class p ON p.oid = i.inhparent
            WHERE p.relname = 'events'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names_are_zero_padded() {
        assert_eq!(partition_name(2025, 6), "events_y2025m06");
        assert_eq!(partition_name(2025, 12), "events_y2025m12");
    }

    #[test]
    fn partition_names_round_trip() {
        for (year, month) in [(2024, 1), (2025, 6), (2030, 12)] {
            let name = partition_name(year, month);
            assert_eq!(parse_partition_name(&name), Some((year, month)));
        }
        assert_eq!(parse_partition_name("events"), None);
        assert_eq!(parse_partition_name("events_y2025m13"), None);
        assert_eq!(parse_partition_name("other_y2025m06"), None);
    }

    #[test]
    fn month_arithmetic_wraps_years() {
        assert_eq!(add_months(2025, 11, 0), (2025, 11));
        assert_eq!(add_months(2025, 11, 1), (2025, 12));
        assert_eq!(add_months(2025, 11, 2), (2026, 1));
        assert_eq!(add_months(2025, 12, 3), (2026, 3));
    }

    #[test]
    fn month_bounds_are_half_open() {
        let (start, end) = month_bounds(2025, 6).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());

        let (start, end) = month_bounds(2025, 12).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
    }
}
