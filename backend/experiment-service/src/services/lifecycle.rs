/// Experiment lifecycle: CRUD plus the Draft -> Active -> Paused -> Active ->
/// Archived state machine.
///
/// Activation validates the allocation invariants and bumps the version;
/// version-changing transitions invalidate the assignment cache for the
/// experiment. Persisted assignments are never reshuffled.

use sqlx::PgPool;
use tracing::{info, warn};

use crate::cache::AssignmentCache;
use crate::db::experiment_repo;
use crate::error::{AppError, Result};
use crate::models::{
    CreateExperimentRequest, CreateVariantRequest, Experiment, ExperimentResponse,
    ExperimentStatus, UpdateExperimentRequest,
};

pub struct LifecycleService {
    pool: PgPool,
    cache: AssignmentCache,
}

/// Legal status transitions. Same-state activation is handled separately as
/// an idempotent no-op.
pub fn can_transition(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    use ExperimentStatus::*;
    matches!(
        (from, to),
        (Draft, Active) | (Active, Paused) | (Paused, Active) | (Draft, Archived)
            | (Active, Archived) | (Paused, Archived)
    )
}

/// Allocation invariants checked at creation and again at activation:
/// percentages sum to 100, exactly one control, unique keys.
pub fn validate_variants(variants: &[CreateVariantRequest]) -> Result<()> {
    if variants.is_empty() {
        return Err(AppError::Validation(
            "an experiment needs at least one variant".to_string(),
        ));
    }

    let total: i32 = variants.iter().map(|v| v.allocation_pct).sum();
    if total != 100 {
        return Err(AppError::Validation(format!(
            "variant allocations must sum to 100, got {}",
            total
        )));
    }

    let controls = variants.iter().filter(|v| v.is_control).count();
    if controls != 1 {
        return Err(AppError::Validation(format!(
            "exactly one control variant required, got {}",
            controls
        )));
    }

    let mut keys: Vec<&str> = variants.iter().map(|v| v.key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.len() != variants.len() {
        return Err(AppError::Validation(
            "variant keys must be unique within the experiment".to_string(),
        ));
    }

    Ok(())
}

fn persisted_allocation_check(
    variants: &[crate::models::Variant],
) -> Result<()> {
    let total: i32 = variants.iter().map(|v| v.allocation_pct).sum();
    if total != 100 {
        return Err(AppError::Validation(format!(
            "variant allocations must sum to 100, got {}",
            total
        )));
    }
    let controls = variants.iter().filter(|v| v.is_control).count();
    if controls != 1 {
        return Err(AppError::Validation(format!(
            "exactly one control variant required, got {}",
            controls
        )));
    }
    Ok(())
}

impl LifecycleService {
    pub fn new(pool: PgPool, cache: AssignmentCache) -> Self {
        Self { pool, cache }
    }

    pub async fn create(&self, req: CreateExperimentRequest) -> Result<ExperimentResponse> {
        validate_variants(&req.variants)?;

        // The seed defaults to the key and is immutable afterwards.
        let seed = req.seed.clone().unwrap_or_else(|| req.key.clone());

        let mut tx = self.pool.begin().await?;
        let experiment = experiment_repo::insert_experiment(&mut tx, &req, &seed).await?;
        let variants =
            experiment_repo::insert_variants(&mut tx, experiment.id, &req.variants).await?;
        tx.commit().await?;

        info!(experiment_id = experiment.id, key = %experiment.key, "Experiment created");

        Ok(ExperimentResponse {
            experiment,
            variants,
        })
    }

    pub async fn get(&self, experiment_id: i64) -> Result<ExperimentResponse> {
        let experiment = self.require_experiment(experiment_id).await?;
        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;

        Ok(ExperimentResponse {
            experiment,
            variants,
        })
    }

    pub async fn list(
        &self,
        status: Option<ExperimentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Experiment>> {
        Ok(experiment_repo::list_experiments(&self.pool, status, limit, offset).await?)
    }

    pub async fn update(
        &self,
        experiment_id: i64,
        patch: UpdateExperimentRequest,
    ) -> Result<ExperimentResponse> {
        let experiment = experiment_repo::update_experiment(&self.pool, experiment_id, &patch)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))?;
        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;

        Ok(ExperimentResponse {
            experiment,
            variants,
        })
    }

    /// Activate an experiment. Re-activating an Active experiment is a no-op
    /// returning the current version.
    pub async fn activate(&self, experiment_id: i64) -> Result<ExperimentResponse> {
        let experiment = self.require_experiment(experiment_id).await?;
        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;

        if experiment.status == ExperimentStatus::Active {
            return Ok(ExperimentResponse {
                experiment,
                variants,
            });
        }

        if !can_transition(experiment.status, ExperimentStatus::Active) {
            return Err(AppError::PreconditionFailed(format!(
                "cannot activate experiment in status {}",
                experiment.status.as_str()
            )));
        }

        persisted_allocation_check(&variants)?;

        let mut tx = self.pool.begin().await?;
        let updated = experiment_repo::set_status(&mut tx, experiment_id, ExperimentStatus::Active, true)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))?;
        tx.commit().await?;

        self.invalidate_assignments(experiment_id).await;
        info!(experiment_id, version = updated.version, "Experiment activated");

        Ok(ExperimentResponse {
            experiment: updated,
            variants,
        })
    }

    /// Pause stops new assignments; events keep flowing to avoid data loss.
    pub async fn pause(&self, experiment_id: i64) -> Result<ExperimentResponse> {
        let experiment = self.require_experiment(experiment_id).await?;

        if !can_transition(experiment.status, ExperimentStatus::Paused) {
            return Err(AppError::PreconditionFailed(format!(
                "only active experiments can be paused (status: {})",
                experiment.status.as_str()
            )));
        }

        let mut tx = self.pool.begin().await?;
        let updated = experiment_repo::set_status(&mut tx, experiment_id, ExperimentStatus::Paused, false)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))?;
        tx.commit().await?;

        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;
        info!(experiment_id, "Experiment paused");

        Ok(ExperimentResponse {
            experiment: updated,
            variants,
        })
    }

    /// Archive is the soft delete: data stays readable, writes stop.
    pub async fn archive(&self, experiment_id: i64) -> Result<ExperimentResponse> {
        let experiment = self.require_experiment(experiment_id).await?;

        if experiment.status == ExperimentStatus::Archived {
            let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;
            return Ok(ExperimentResponse {
                experiment,
                variants,
            });
        }

        let mut tx = self.pool.begin().await?;
        let updated =
            experiment_repo::set_status(&mut tx, experiment_id, ExperimentStatus::Archived, false)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("experiment {} not found", experiment_id))
                })?;
        tx.commit().await?;

        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;
        info!(experiment_id, "Experiment archived");

        Ok(ExperimentResponse {
            experiment: updated,
            variants,
        })
    }

    /// Hard delete cascades to variants and assignments; event rows are
    /// cleaned up by partition retention.
    pub async fn hard_delete(&self, experiment_id: i64) -> Result<()> {
        let deleted = experiment_repo::hard_delete_experiment(&self.pool, experiment_id).await?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!(
                "experiment {} not found",
                experiment_id
            )));
        }

        self.invalidate_assignments(experiment_id).await;
        info!(experiment_id, "Experiment hard-deleted");
        Ok(())
    }

    /// Edit variant allocations. Bumps the version and invalidates cached
    /// assignments; persisted assignments stay sticky.
    pub async fn update_allocations(
        &self,
        experiment_id: i64,
        allocations: &[(i64, i32)],
    ) -> Result<ExperimentResponse> {
        let experiment = self.require_experiment(experiment_id).await?;

        let mut tx = self.pool.begin().await?;
        for (variant_id, allocation_pct) in allocations {
            if !(0..=100).contains(allocation_pct) {
                return Err(AppError::Validation(format!(
                    "allocation {} out of range for variant {}",
                    allocation_pct, variant_id
                )));
            }
            let res = sqlx::query(
                "UPDATE variants SET allocation_pct = $1, updated_at = NOW() \
                 WHERE id = $2 AND experiment_id = $3",
            )
            .bind(allocation_pct)
            .bind(variant_id)
            .bind(experiment_id)
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() == 0 {
                return Err(AppError::NotFound(format!(
                    "variant {} not found in experiment {}",
                    variant_id, experiment_id
                )));
            }
        }

        let updated = experiment_repo::bump_version(&mut tx, experiment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))?;

        // Re-check the invariant with the new numbers before committing.
        let variants = sqlx::query_as::<_, crate::models::Variant>(
            "SELECT id, experiment_id, key, name, description, allocation_pct, is_control, \
             config, created_at, updated_at FROM variants WHERE experiment_id = $1 ORDER BY id",
        )
        .bind(experiment_id)
        .fetch_all(&mut *tx)
        .await?;

        if experiment.status == ExperimentStatus::Active {
            persisted_allocation_check(&variants)?;
        }

        tx.commit().await?;
        self.invalidate_assignments(experiment_id).await;

        Ok(ExperimentResponse {
            experiment: updated,
            variants,
        })
    }

    async fn require_experiment(&self, experiment_id: i64) -> Result<Experiment> {
        experiment_repo::find_experiment(&self.pool, experiment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))
    }

    async fn invalidate_assignments(&self, experiment_id: i64) {
        if let Err(e) = self.cache.invalidate_experiment(experiment_id).await {
            warn!(experiment_id, "Assignment cache invalidation failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant_spec(key: &str, pct: i32, control: bool) -> CreateVariantRequest {
        CreateVariantRequest {
            key: key.to_string(),
            name: key.to_string(),
            description: None,
            allocation_pct: pct,
            is_control: control,
            config: serde_json::json!({}),
        }
    }

    #[test]
    fn legal_transitions() {
        use ExperimentStatus::*;
        assert!(can_transition(Draft, Active));
        assert!(can_transition(Active, Paused));
        assert!(can_transition(Paused, Active));
        assert!(can_transition(Draft, Archived));
        assert!(can_transition(Active, Archived));
        assert!(can_transition(Paused, Archived));
    }

    #[test]
    fn illegal_transitions() {
        use ExperimentStatus::*;
        assert!(!can_transition(Archived, Active));
        assert!(!can_transition(Archived, Paused));
        assert!(!can_transition(Draft, Paused));
    }

    #[test]
    fn allocations_must_sum_to_one_hundred() {
        let variants = vec![
            variant_spec("control", 40, true),
            variant_spec("treatment", 40, false),
        ];
        assert!(matches!(
            validate_variants(&variants),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn exactly_one_control_is_required() {
        let none = vec![
            variant_spec("a", 50, false),
            variant_spec("b", 50, false),
        ];
        assert!(matches!(validate_variants(&none), Err(AppError::Validation(_))));

        let two = vec![
            variant_spec("a", 50, true),
            variant_spec("b", 50, true),
        ];
        assert!(matches!(validate_variants(&two), Err(AppError::Validation(_))));
    }

    #[test]
    fn duplicate_variant_keys_are_rejected() {
        let variants = vec![
            variant_spec("same", 50, true),
            variant_spec("same", 50, false),
        ];
        assert!(matches!(
            validate_variants(&variants),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn valid_split_passes() {
        let variants = vec![
            variant_spec("control", 33, true),
            variant_spec("green", 33, false),
            variant_spec("red", 34, false),
        ];
        assert!(validate_variants(&variants).is_ok());
    }
}
