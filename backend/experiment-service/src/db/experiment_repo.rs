use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{
    CreateExperimentRequest, CreateVariantRequest, Experiment, ExperimentStatus,
    UpdateExperimentRequest, Variant,
};

const EXPERIMENT_COLUMNS: &str =
    "id, key, name, description, status, seed, version, config, starts_at, ends_at, \
     created_at, updated_at";

const VARIANT_COLUMNS: &str =
    "id, experiment_id, key, name, description, allocation_pct, is_control, config, \
     created_at, updated_at";

/// Find an experiment by id
pub async fn find_experiment(
    pool: &PgPool,
    experiment_id: i64,
) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(&format!(
        "SELECT {} FROM experiments WHERE id = $1",
        EXPERIMENT_COLUMNS
    ))
    .bind(experiment_id)
    .fetch_optional(pool)
    .await
}

/// List experiments, optionally filtered by status, newest first
pub async fn list_experiments(
    pool: &PgPool,
    status: Option<ExperimentStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Experiment>, sqlx::Error> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, Experiment>(&format!(
                "SELECT {} FROM experiments WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                EXPERIMENT_COLUMNS
            ))
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Experiment>(&format!(
                "SELECT {} FROM experiments ORDER BY created_at DESC LIMIT $1 OFFSET $2",
                EXPERIMENT_COLUMNS
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
}

/// Variants of an experiment ordered by id
pub async fn variants_for(
    pool: &PgPool,
    experiment_id: i64,
) -> Result<Vec<Variant>, sqlx::Error> {
    sqlx::query_as::<_, Variant>(&format!(
        "SELECT {} FROM variants WHERE experiment_id = $1 ORDER BY id ASC",
        VARIANT_COLUMNS
    ))
    .bind(experiment_id)
    .fetch_all(pool)
    .await
}

/// Insert a Draft experiment inside a transaction
pub async fn insert_experiment(
    tx: &mut Transaction<'_, Postgres>,
    req: &CreateExperimentRequest,
    seed: &str,
) -> Result<Experiment, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(&format!(
        r#"
        INSERT INTO experiments (key, name, description, status, seed, config, starts_at, ends_at)
        VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7)
        RETURNING {}
        "#,
        EXPERIMENT_COLUMNS
    ))
    .bind(&req.key)
    .bind(&req.name)
    .bind(&req.description)
    .bind(seed)
    .bind(&req.config)
    .bind(req.starts_at)
    .bind(req.ends_at)
    .fetch_one(&mut **tx)
    .await
}

/// Insert the experiment's variants inside the same transaction
pub async fn insert_variants(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
    variants: &[CreateVariantRequest],
) -> Result<Vec<Variant>, sqlx::Error> {
    let mut created = Vec::with_capacity(variants.len());

    for spec in variants {
        let variant = sqlx::query_as::<_, Variant>(&format!(
            r#"
            INSERT INTO variants (experiment_id, key, name, description, allocation_pct, is_control, config)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            VARIANT_COLUMNS
        ))
        .bind(experiment_id)
        .bind(&spec.key)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.allocation_pct)
        .bind(spec.is_control)
        .bind(&spec.config)
        .fetch_one(&mut **tx)
        .await?;

        created.push(variant);
    }

    Ok(created)
}

/// Patch mutable experiment fields; seed and status are never touched here
pub async fn update_experiment(
    pool: &PgPool,
    experiment_id: i64,
    patch: &UpdateExperimentRequest,
) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(&format!(
        r#"
        UPDATE experiments
        SET name = COALESCE($2, name),
            description = COALESCE($3, description),
            config = COALESCE($4, config),
            starts_at = COALESCE($5, starts_at),
            ends_at = COALESCE($6, ends_at),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        EXPERIMENT_COLUMNS
    ))
    .bind(experiment_id)
    .bind(&patch.name)
    .bind(&patch.description)
    .bind(&patch.config)
    .bind(patch.starts_at)
    .bind(patch.ends_at)
    .fetch_optional(pool)
    .await
}

/// Transition experiment status; bumps the version when the transition
/// changes allocation visibility (Draft->Active, Paused->Active)
pub async fn set_status(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
    status: ExperimentStatus,
    bump_version: bool,
) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(&format!(
        r#"
        UPDATE experiments
        SET status = $2,
            version = version + $3,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        EXPERIMENT_COLUMNS
    ))
    .bind(experiment_id)
    .bind(status)
    .bind(if bump_version { 1 } else { 0 })
    .fetch_optional(&mut **tx)
    .await
}

/// Bump version after a variant-allocation edit
pub async fn bump_version(
    tx: &mut Transaction<'_, Postgres>,
    experiment_id: i64,
) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(&format!(
        r#"
        UPDATE experiments
        SET version = version + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        EXPERIMENT_COLUMNS
    ))
    .bind(experiment_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Hard delete; cascades to variants and assignments, events are cleaned by
/// partition retention
pub async fn hard_delete_experiment(pool: &PgPool, experiment_id: i64) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("DELETE FROM experiments WHERE id = $1")
        .bind(experiment_id)
        .execute(pool)
        .await?;

    Ok(res.rows_affected())
}
