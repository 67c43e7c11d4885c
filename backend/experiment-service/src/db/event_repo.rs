use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::models::{Event, Granularity};

/// Per-variant totals over a window, post-assignment events only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariantTotalsRow {
    pub variant_id: i64,
    pub event_count: i64,
    pub unique_users: i64,
    pub conversions: i64,
}

/// One time-series bucket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimeBucketRow {
    pub variant_id: i64,
    pub bucket: DateTime<Utc>,
    pub event_type: String,
    pub event_count: i64,
    pub unique_users: i64,
}

/// Raw rows feeding the funnel scan, ordered by user then time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FunnelEventRow {
    pub variant_id: i64,
    pub user_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Insert one event inside a transaction
pub async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &Event,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO events (id, experiment_id, user_id, variant_id, event_type, timestamp,
                            assignment_at, properties, session_id, request_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(event.id)
    .bind(event.experiment_id)
    .bind(&event.user_id)
    .bind(event.variant_id)
    .bind(&event.event_type)
    .bind(event.timestamp)
    .bind(event.assignment_at)
    .bind(&event.properties)
    .bind(&event.session_id)
    .bind(&event.request_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Insert a batch of events with one set-oriented statement.
/// All rows commit with the surrounding transaction or none do.
pub async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[Event],
) -> Result<u64, sqlx::Error> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO events (id, experiment_id, user_id, variant_id, event_type, timestamp, \
         assignment_at, properties, session_id, request_id) ",
    );

    builder.push_values(events, |mut row, event| {
        row.push_bind(event.id)
            .push_bind(event.experiment_id)
            .push_bind(&event.user_id)
            .push_bind(event.variant_id)
            .push_bind(&event.event_type)
            .push_bind(event.timestamp)
            .push_bind(event.assignment_at)
            .push_bind(&event.properties)
            .push_bind(&event.session_id)
            .push_bind(&event.request_id);
    });

    let res = builder.build().execute(&mut **tx).await?;
    Ok(res.rows_affected())
}

fn push_window_filters<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    experiment_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    event_types: Option<&'a [String]>,
    property_filter: Option<&'a serde_json::Value>,
) {
    builder.push(" WHERE experiment_id = ").push_bind(experiment_id);
    builder.push(" AND timestamp >= ").push_bind(start);
    builder.push(" AND timestamp <= ").push_bind(end);
    // Post-assignment filter: only events at-or-after assignment count.
    builder.push(" AND variant_id IS NOT NULL AND assignment_at IS NOT NULL");
    builder.push(" AND timestamp >= assignment_at");

    if let Some(types) = event_types {
        builder.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
    if let Some(filter) = property_filter {
        builder.push(" AND properties @> ").push_bind(filter);
    }
}

/// Per-variant totals over the window
pub async fn variant_totals(
    pool: &PgPool,
    experiment_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    event_types: Option<&[String]>,
    property_filter: Option<&serde_json::Value>,
) -> Result<Vec<VariantTotalsRow>, sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT variant_id, \
                COUNT(*) AS event_count, \
                COUNT(DISTINCT user_id) AS unique_users, \
                COUNT(*) FILTER (WHERE event_type = 'conversion') AS conversions \
         FROM events",
    );

    push_window_filters(&mut builder, experiment_id, start, end, event_types, property_filter);
    builder.push(" GROUP BY variant_id");

    builder
        .build_query_as::<VariantTotalsRow>()
        .fetch_all(pool)
        .await
}

/// Time series grouped by variant, bucket and event type
pub async fn time_series(
    pool: &PgPool,
    experiment_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    event_types: Option<&[String]>,
    property_filter: Option<&serde_json::Value>,
    granularity: Granularity,
) -> Result<Vec<TimeBucketRow>, sqlx::Error> {
    let bucket_expr = match granularity.trunc_unit() {
        Some(unit) => format!("date_trunc('{}', timestamp)", unit),
        None => "timestamp".to_string(),
    };

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "SELECT variant_id, {} AS bucket, event_type, \
                COUNT(*) AS event_count, \
                COUNT(DISTINCT user_id) AS unique_users \
         FROM events",
        bucket_expr
    ));

    push_window_filters(&mut builder, experiment_id, start, end, event_types, property_filter);
    builder.push(" GROUP BY variant_id, bucket, event_type ORDER BY bucket ASC");

    builder
        .build_query_as::<TimeBucketRow>()
        .fetch_all(pool)
        .await
}

/// Valid events for the funnel scan, ordered by user then timestamp
pub async fn funnel_events(
    pool: &PgPool,
    experiment_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_types: &[String],
) -> Result<Vec<FunnelEventRow>, sqlx::Error> {
    sqlx::query_as::<_, FunnelEventRow>(
        r#"
        SELECT variant_id, user_id, event_type, timestamp
        FROM events
        WHERE experiment_id = $1
          AND timestamp >= $2
          AND timestamp <= $3
          AND variant_id IS NOT NULL
          AND assignment_at IS NOT NULL
          AND timestamp >= assignment_at
          AND event_type = ANY($4)
        ORDER BY user_id ASC, timestamp ASC
        "#,
    )
    .bind(experiment_id)
    .bind(start)
    .bind(end)
    .bind(step_types)
    .fetch_all(pool)
    .await
}
