/// Analytical rollup access.
///
/// The rollup is keyed by (experiment_id, variant_id, day, event_type) and is
/// maintained by a materialized view over the stream table the rollup
/// consumer writes. Distinct users are kept as uniqExact aggregate states so
/// merging across days stays exact and the operational and analytical paths
/// agree.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::db::ch_client::ClickHouseClient;
use crate::error::Result;

/// Per-variant totals merged over the selected days.
#[derive(Debug, Clone, clickhouse::Row, Deserialize)]
pub struct RollupTotalsRow {
    pub variant_id: i64,
    pub event_count: u64,
    pub unique_users: u64,
    pub conversions: u64,
}

/// One (variant, day, event type) series point.
#[derive(Debug, Clone, clickhouse::Row, Deserialize)]
pub struct RollupSeriesRow {
    pub variant_id: i64,
    pub day: String,
    pub event_type: String,
    pub event_count: u64,
    pub unique_users: u64,
}

/// A raw stream row as written by the rollup consumer.
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub event_id: String,
    pub experiment_id: i64,
    pub variant_id: i64,
    pub user_id: String,
    pub event_type: String,
    pub day: NaiveDate,
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Create the analytical tables when absent.
pub async fn ensure_analytics_schema(ch: &ClickHouseClient) -> Result<()> {
    ch.execute(
        r#"
        CREATE TABLE IF NOT EXISTS events_stream (
            event_id      String,
            experiment_id Int64,
            variant_id    Int64,
            user_id       String,
            event_type    String,
            day           Date
        ) ENGINE = MergeTree
        ORDER BY (experiment_id, variant_id, day, event_type)
        "#,
    )
    .await?;

    ch.execute(
        r#"
        CREATE TABLE IF NOT EXISTS events_rollup (
            experiment_id    Int64,
            variant_id       Int64,
            day              Date,
            event_type       String,
            uniq_users_state AggregateFunction(uniqExact, String),
            event_count      UInt64,
            conversions      UInt64
        ) ENGINE = AggregatingMergeTree
        ORDER BY (experiment_id, variant_id, day, event_type)
        "#,
    )
    .await?;

    ch.execute(
        r#"
        CREATE MATERIALIZED VIEW IF NOT EXISTS events_rollup_mv TO events_rollup AS
        SELECT experiment_id,
               variant_id,
               day,
               event_type,
               uniqExactState(user_id) AS uniq_users_state,
               count() AS event_count,
               countIf(event_type = 'conversion') AS conversions
        FROM events_stream
        GROUP BY experiment_id, variant_id, day, event_type
        "#,
    )
    .await?;

    Ok(())
}

/// Insert stream rows with one VALUES statement.
pub async fn insert_stream_rows(ch: &ClickHouseClient, rows: &[StreamRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            format!(
                "('{}', {}, {}, '{}', '{}', '{}')",
                escape(&row.event_id),
                row.experiment_id,
                row.variant_id,
                escape(&row.user_id),
                escape(&row.event_type),
                row.day.format("%Y-%m-%d"),
            )
        })
        .collect();

    let query = format!(
        "INSERT INTO events_stream (event_id, experiment_id, variant_id, user_id, event_type, day) \
         VALUES {}",
        values.join(", ")
    );

    ch.execute(&query).await
}

/// Per-variant totals over `[start_day, end_day]`
pub async fn variant_totals(
    ch: &ClickHouseClient,
    experiment_id: i64,
    start_day: NaiveDate,
    end_day: NaiveDate,
    event_types: Option<&[String]>,
) -> Result<Vec<RollupTotalsRow>> {
    let mut template = String::from(
        r#"
        SELECT variant_id,
               sum(event_count) AS event_count,
               uniqExactMerge(uniq_users_state) AS unique_users,
               sum(if(event_type = 'conversion', event_count, 0)) AS conversions
        FROM events_rollup
        WHERE experiment_id = ?
          AND day >= ?
          AND day <= ?
        "#,
    );
    if event_types.is_some() {
        template.push_str(" AND event_type IN ?");
    }
    template.push_str(" GROUP BY variant_id");

    ch.query_with_params::<RollupTotalsRow, _>(&template, |mut query| {
        query = query
            .bind(experiment_id)
            .bind(start_day.format("%Y-%m-%d").to_string())
            .bind(end_day.format("%Y-%m-%d").to_string());
        if let Some(types) = event_types {
            query = query.bind(types);
        }
        query
    })
    .await
}

/// Daily series over `[start_day, end_day]`
pub async fn daily_series(
    ch: &ClickHouseClient,
    experiment_id: i64,
    start_day: NaiveDate,
    end_day: NaiveDate,
    event_types: Option<&[String]>,
) -> Result<Vec<RollupSeriesRow>> {
    let mut template = String::from(
        r#"
        SELECT variant_id,
               toString(day) AS day,
               event_type,
               sum(event_count) AS event_count,
               uniqExactMerge(uniq_users_state) AS unique_users
        FROM events_rollup
        WHERE experiment_id = ?
          AND day >= ?
          AND day <= ?
        "#,
    );
    if event_types.is_some() {
        template.push_str(" AND event_type IN ?");
    }
    template.push_str(" GROUP BY variant_id, day, event_type ORDER BY day ASC");

    ch.query_with_params::<RollupSeriesRow, _>(&template, |mut query| {
        query = query
            .bind(experiment_id)
            .bind(start_day.format("%Y-%m-%d").to_string())
            .bind(end_day.format("%Y-%m-%d").to_string());
        if let Some(types) = event_types {
            query = query.bind(types);
        }
        query
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_neutralizes_quotes() {
        assert_eq!(escape("it's"), "it\\'s");
        assert_eq!(escape("a\\b"), "a\\\\b");
    }
}
