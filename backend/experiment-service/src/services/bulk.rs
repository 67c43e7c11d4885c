/// Administrative bulk writer.
///
/// Each operation is one set-oriented statement inside one transaction: a
/// constraint violation rolls back the whole batch and is reported as a
/// single batch-level failure so the caller can retry without the offending
/// rows. Bulk assignment is the administrative override path and is the only
/// writer allowed to mutate existing assignment rows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;
use transactional_outbox::{NewOutboxRecord, SqlxOutboxRepository};

use crate::db::experiment_repo;
use crate::error::{AppError, Result};
use crate::models::{Assignment, CreateExperimentRequest, ExperimentResponse};
use crate::services::lifecycle;

pub struct BulkService {
    pool: PgPool,
    outbox: Arc<SqlxOutboxRepository>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAssignmentSpec {
    pub experiment_id: i64,
    pub user_id: String,
    pub variant_id: i64,
    pub source: Option<String>,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentPatch {
    pub variant_id: Option<i64>,
    pub source: Option<String>,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct BulkFailure {
    pub error: String,
    pub batch: usize,
}

#[derive(Debug, Serialize)]
pub struct BulkOutcome<T> {
    pub successful: Vec<T>,
    pub failed: Vec<BulkFailure>,
}

impl<T> BulkOutcome<T> {
    fn all_failed(error: impl ToString, batch: usize) -> Self {
        Self {
            successful: Vec::new(),
            failed: vec![BulkFailure {
                error: error.to_string(),
                batch,
            }],
        }
    }
}

impl BulkService {
    pub fn new(pool: PgPool, outbox: Arc<SqlxOutboxRepository>) -> Self {
        Self { pool, outbox }
    }

    /// Create several Draft experiments with their variants atomically.
    pub async fn create_experiments(
        &self,
        specs: Vec<CreateExperimentRequest>,
    ) -> Result<BulkOutcome<ExperimentResponse>> {
        let batch = specs.len();
        if batch == 0 {
            return Ok(BulkOutcome {
                successful: Vec::new(),
                failed: Vec::new(),
            });
        }

        for spec in &specs {
            if let Err(e) = lifecycle::validate_variants(&spec.variants) {
                return Ok(BulkOutcome::all_failed(e, batch));
            }
        }

        let outcome: Result<Vec<ExperimentResponse>> = async {
            let mut tx = self.pool.begin().await?;

            // One multi-row insert for the experiments, one for all variants.
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO experiments (key, name, description, status, seed, config, starts_at, ends_at) ",
            );
            builder.push_values(&specs, |mut row, spec| {
                let seed = spec.seed.clone().unwrap_or_else(|| spec.key.clone());
                row.push_bind(&spec.key)
                    .push_bind(&spec.name)
                    .push_bind(&spec.description)
                    .push_bind(crate::models::ExperimentStatus::Draft)
                    .push_bind(seed)
                    .push_bind(&spec.config)
                    .push_bind(spec.starts_at)
                    .push_bind(spec.ends_at);
            });
            builder.push(
                " RETURNING id, key, name, description, status, seed, version, config, \
                 starts_at, ends_at, created_at, updated_at",
            );

            let experiments: Vec<crate::models::Experiment> =
                builder.build_query_as().fetch_all(&mut *tx).await?;

            // Rows come back in VALUES order, pairing each with its spec.
            let mut variant_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO variants (experiment_id, key, name, description, allocation_pct, is_control, config) ",
            );
            let flattened: Vec<(i64, &crate::models::CreateVariantRequest)> = experiments
                .iter()
                .zip(&specs)
                .flat_map(|(experiment, spec)| {
                    spec.variants.iter().map(move |v| (experiment.id, v))
                })
                .collect();
            variant_builder.push_values(&flattened, |mut row, (experiment_id, variant)| {
                row.push_bind(*experiment_id)
                    .push_bind(&variant.key)
                    .push_bind(&variant.name)
                    .push_bind(&variant.description)
                    .push_bind(variant.allocation_pct)
                    .push_bind(variant.is_control)
                    .push_bind(&variant.config);
            });
            variant_builder.push(
                " RETURNING id, experiment_id, key, name, description, allocation_pct, \
                 is_control, config, created_at, updated_at",
            );

            let variants: Vec<crate::models::Variant> =
                variant_builder.build_query_as().fetch_all(&mut *tx).await?;

            tx.commit().await?;

            let created = experiments
                .into_iter()
                .map(|experiment| {
                    let experiment_variants = variants
                        .iter()
                        .filter(|v| v.experiment_id == experiment.id)
                        .cloned()
                        .collect();
                    ExperimentResponse {
                        experiment,
                        variants: experiment_variants,
                    }
                })
                .collect();
            Ok(created)
        }
        .await;

        match outcome {
            Ok(successful) => Ok(BulkOutcome {
                successful,
                failed: Vec::new(),
            }),
            Err(e) => {
                warn!("Bulk experiment creation rolled back: {}", e);
                Ok(BulkOutcome::all_failed(e, batch))
            }
        }
    }

    /// Administrative assignment upsert: `ON CONFLICT DO UPDATE`, overriding
    /// the hasher. The event ingestion path never uses this mode.
    pub async fn upsert_assignments(
        &self,
        specs: Vec<BulkAssignmentSpec>,
    ) -> Result<BulkOutcome<Assignment>> {
        let batch = specs.len();
        if batch == 0 {
            return Ok(BulkOutcome {
                successful: Vec::new(),
                failed: Vec::new(),
            });
        }

        // Variants must belong to their experiment (assignment invariant) and
        // the experiment version is stamped on every row.
        let experiment_ids: HashSet<i64> = specs.iter().map(|s| s.experiment_id).collect();
        let mut versions: HashMap<i64, i32> = HashMap::new();
        let mut valid_variants: HashSet<(i64, i64)> = HashSet::new();

        for experiment_id in &experiment_ids {
            let experiment = match experiment_repo::find_experiment(&self.pool, *experiment_id)
                .await?
            {
                Some(experiment) => experiment,
                None => {
                    return Ok(BulkOutcome::all_failed(
                        AppError::NotFound(format!("experiment {} not found", experiment_id)),
                        batch,
                    ))
                }
            };
            versions.insert(*experiment_id, experiment.version);

            for variant in experiment_repo::variants_for(&self.pool, *experiment_id).await? {
                valid_variants.insert((*experiment_id, variant.id));
            }
        }

        for spec in &specs {
            if !valid_variants.contains(&(spec.experiment_id, spec.variant_id)) {
                return Ok(BulkOutcome::all_failed(
                    AppError::Validation(format!(
                        "variant {} does not belong to experiment {}",
                        spec.variant_id, spec.experiment_id
                    )),
                    batch,
                ));
            }
        }

        let outcome: Result<Vec<Assignment>> = async {
            let mut tx = self.pool.begin().await?;

            // Referenced users must exist; the override path provisions them.
            let user_ids: HashSet<&str> = specs.iter().map(|s| s.user_id.as_str()).collect();
            for user_id in user_ids {
                crate::db::user_repo::ensure_user(&mut tx, user_id).await?;
            }

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO assignments (experiment_id, user_id, variant_id, version, source, context) ",
            );
            builder.push_values(&specs, |mut row, spec| {
                row.push_bind(spec.experiment_id)
                    .push_bind(&spec.user_id)
                    .push_bind(spec.variant_id)
                    .push_bind(versions.get(&spec.experiment_id).copied().unwrap_or(1))
                    .push_bind(spec.source.clone().unwrap_or_else(|| "override".to_string()))
                    .push_bind(spec.context.clone().unwrap_or_else(|| json!({})));
            });
            builder.push(
                " ON CONFLICT (experiment_id, user_id) DO UPDATE SET \
                   variant_id = EXCLUDED.variant_id, \
                   source = EXCLUDED.source, \
                   context = EXCLUDED.context, \
                   updated_at = NOW() \
                 RETURNING id, experiment_id, user_id, variant_id, version, source, context, \
                   assigned_at, enrolled_at, created_at, updated_at",
            );

            let assignments: Vec<Assignment> =
                builder.build_query_as().fetch_all(&mut *tx).await?;

            let records: Vec<NewOutboxRecord> = assignments
                .iter()
                .map(|a| {
                    NewOutboxRecord::new(
                        "assignment",
                        format!("{}:{}", a.experiment_id, a.user_id),
                        "assignment.created",
                        json!({
                            "experiment_id": a.experiment_id,
                            "user_id": a.user_id,
                            "variant_id": a.variant_id,
                            "version": a.version,
                            "source": a.source,
                            "assigned_at": a.assigned_at,
                            "enrolled": a.enrolled_at.is_some(),
                        }),
                    )
                })
                .collect();
            self.outbox.insert_many(&mut tx, &records).await?;

            tx.commit().await?;
            Ok(assignments)
        }
        .await;

        match outcome {
            Ok(successful) => Ok(BulkOutcome {
                successful,
                failed: Vec::new(),
            }),
            Err(e) => {
                warn!("Bulk assignment upsert rolled back: {}", e);
                Ok(BulkOutcome::all_failed(e, batch))
            }
        }
    }

    /// Patch a set of assignments with one statement.
    pub async fn update_assignments(
        &self,
        assignment_ids: &[i64],
        patch: AssignmentPatch,
    ) -> Result<BulkOutcome<Assignment>> {
        let batch = assignment_ids.len();
        if batch == 0 {
            return Ok(BulkOutcome {
                successful: Vec::new(),
                failed: Vec::new(),
            });
        }
        if patch.variant_id.is_none() && patch.source.is_none() && patch.context.is_none() {
            return Ok(BulkOutcome::all_failed(
                AppError::Validation("empty patch".to_string()),
                batch,
            ));
        }

        let outcome: Result<Vec<Assignment>> = async {
            let assignments = sqlx::query_as::<_, Assignment>(
                r#"
                UPDATE assignments
                SET variant_id = COALESCE($2, variant_id),
                    source = COALESCE($3, source),
                    context = COALESCE($4, context),
                    updated_at = NOW()
                WHERE id = ANY($1)
                RETURNING id, experiment_id, user_id, variant_id, version, source, context,
                          assigned_at, enrolled_at, created_at, updated_at
                "#,
            )
            .bind(assignment_ids)
            .bind(patch.variant_id)
            .bind(&patch.source)
            .bind(&patch.context)
            .fetch_all(&self.pool)
            .await?;
            Ok(assignments)
        }
        .await;

        match outcome {
            Ok(successful) => Ok(BulkOutcome {
                successful,
                failed: Vec::new(),
            }),
            Err(e) => {
                warn!("Bulk assignment update failed: {}", e);
                Ok(BulkOutcome::all_failed(e, batch))
            }
        }
    }

    /// Delete a set of assignments with one statement.
    pub async fn delete_assignments(&self, assignment_ids: &[i64]) -> Result<BulkOutcome<i64>> {
        let batch = assignment_ids.len();
        if batch == 0 {
            return Ok(BulkOutcome {
                successful: Vec::new(),
                failed: Vec::new(),
            });
        }

        let outcome: Result<Vec<i64>> = async {
            let rows: Vec<(i64,)> =
                sqlx::query_as("DELETE FROM assignments WHERE id = ANY($1) RETURNING id")
                    .bind(assignment_ids)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        }
        .await;

        match outcome {
            Ok(successful) => Ok(BulkOutcome {
                successful,
                failed: Vec::new(),
            }),
            Err(e) => {
                warn!("Bulk assignment delete failed: {}", e);
                Ok(BulkOutcome::all_failed(e, batch))
            }
        }
    }
}
