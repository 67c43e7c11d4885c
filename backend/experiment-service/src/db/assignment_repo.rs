use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{Assignment, AssignmentView};

const ASSIGNMENT_COLUMNS: &str =
    "id, experiment_id, user_id, variant_id, version, source, context, assigned_at, \
     enrolled_at, created_at, updated_at";

const VIEW_SELECT: &str = r#"
    SELECT a.experiment_id, e.key AS experiment_key, a.user_id, a.variant_id,
           v.key AS variant_key, v.name AS variant_name, v.is_control,
           a.assigned_at, a.enrolled_at, a.version, a.source
    FROM assignments a
    JOIN variants v ON v.id = a.variant_id
    JOIN experiments e ON e.id = a.experiment_id
"#;

/// Find one assignment joined with variant and experiment
pub async fn find_view(
    pool: &PgPool,
    experiment_id: i64,
    user_id: &str,
) -> Result<Option<AssignmentView>, sqlx::Error> {
    sqlx::query_as::<_, AssignmentView>(&format!(
        "{} WHERE a.experiment_id = $1 AND a.user_id = $2",
        VIEW_SELECT
    ))
    .bind(experiment_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

/// Find a user's assignments across several experiments in one round-trip
pub async fn find_views_for_user(
    pool: &PgPool,
    user_id: &str,
    experiment_ids: &[i64],
) -> Result<Vec<AssignmentView>, sqlx::Error> {
    sqlx::query_as::<_, AssignmentView>(&format!(
        "{} WHERE a.user_id = $1 AND a.experiment_id = ANY($2)",
        VIEW_SELECT
    ))
    .bind(user_id)
    .bind(experiment_ids)
    .fetch_all(pool)
    .await
}

/// First-writer-wins insert under the (experiment_id, user_id) unique
/// constraint. Returns None when another writer already holds the row.
pub async fn insert_if_absent(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
    user_id: &str,
    variant_id: i64,
    version: i32,
    source: &str,
    enrolled_at: Option<DateTime<Utc>>,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!(
        r#"
        INSERT INTO assignments (experiment_id, user_id, variant_id, version, source, enrolled_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (experiment_id, user_id) DO NOTHING
        RETURNING {}
        "#,
        ASSIGNMENT_COLUMNS
    ))
    .bind(experiment_id)
    .bind(user_id)
    .bind(variant_id)
    .bind(version)
    .bind(source)
    .bind(enrolled_at)
    .fetch_optional(&mut **tx)
    .await
}

/// Read the winning row inside the writing transaction
pub async fn find_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
    user_id: &str,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!(
        "SELECT {} FROM assignments WHERE experiment_id = $1 AND user_id = $2",
        ASSIGNMENT_COLUMNS
    ))
    .bind(experiment_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Set enrolled_at exactly once; returns None when it was already set
pub async fn mark_enrolled(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
    user_id: &str,
) -> Result<Option<Assignment>, sqlx::Error> {
    sqlx::query_as::<_, Assignment>(&format!(
        r#"
        UPDATE assignments
        SET enrolled_at = NOW(), updated_at = NOW()
        WHERE experiment_id = $1 AND user_id = $2 AND enrolled_at IS NULL
        RETURNING {}
        "#,
        ASSIGNMENT_COLUMNS
    ))
    .bind(experiment_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
}
