/// Sticky assignment engine.
///
/// `get_or_assign` is the single entry point for variant decisions: cache
/// lookup, then the store, then a deterministic first-writer-wins insert.
/// Persisted assignments never change for source=hash; version bumps only
/// affect future first-time assignments.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, warn};
use transactional_outbox::{record_outbox, NewOutboxRecord, OutboxRepository, SqlxOutboxRepository};

use crate::cache::AssignmentCache;
use crate::db::{assignment_repo, experiment_repo, user_repo};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Assignment, AssignmentView, Experiment, ExperimentStatus, Variant};
use crate::services::hashing;

pub struct AssignmentService {
    pool: PgPool,
    cache: AssignmentCache,
    outbox: Arc<SqlxOutboxRepository>,
    hash_seed: String,
    bucket_size: u32,
}

fn aggregate_id(experiment_id: i64, user_id: &str) -> String {
    format!("{}:{}", experiment_id, user_id)
}

fn created_payload(assignment: &Assignment, variant: &Variant, enrolled: bool) -> serde_json::Value {
    json!({
        "experiment_id": assignment.experiment_id,
        "user_id": assignment.user_id,
        "variant_id": assignment.variant_id,
        "variant_key": variant.key,
        "version": assignment.version,
        "source": assignment.source,
        "assigned_at": assignment.assigned_at,
        "enrolled": enrolled,
    })
}

impl AssignmentService {
    pub fn new(
        pool: PgPool,
        cache: AssignmentCache,
        outbox: Arc<SqlxOutboxRepository>,
        hash_seed: String,
        bucket_size: u32,
    ) -> Self {
        Self {
            pool,
            cache,
            outbox,
            hash_seed,
            bucket_size,
        }
    }

    /// Get the sticky assignment for (experiment, user), creating it on first
    /// contact. Only Active experiments produce new assignments.
    pub async fn get_or_assign(
        &self,
        experiment_id: i64,
        user_id: &str,
        enroll: bool,
        force_refresh: bool,
    ) -> Result<AssignmentView> {
        // 1. Cache lookup; outages degrade to the store.
        if !force_refresh {
            match self.cache.get(experiment_id, user_id).await {
                Ok(Some(cached)) => {
                    metrics::ASSIGNMENT_CACHE_EVENTS.with_label_values(&["hit"]).inc();
                    if enroll && cached.enrolled_at.is_none() {
                        return self.enroll_and_refresh(cached).await;
                    }
                    return Ok(cached);
                }
                Ok(None) => {
                    metrics::ASSIGNMENT_CACHE_EVENTS.with_label_values(&["miss"]).inc();
                }
                Err(e) => {
                    metrics::ASSIGNMENT_CACHE_EVENTS.with_label_values(&["error"]).inc();
                    warn!("Assignment cache read failed, falling back to store: {}", e);
                }
            }
        }

        // 2. Existing row in the store wins unconditionally (stickiness).
        if let Some(view) = assignment_repo::find_view(&self.pool, experiment_id, user_id).await? {
            if enroll && view.enrolled_at.is_none() {
                return self.enroll_and_refresh(view).await;
            }
            self.fill_cache(&view).await;
            return Ok(view);
        }

        // 3. First contact: hash into a variant and insert under the unique
        //    constraint.
        let (experiment, variants) = self.load_active_experiment(experiment_id).await?;
        let bucket = hashing::bucket(user_id, &experiment.seed, &self.hash_seed, self.bucket_size);
        let variant = hashing::choose_variant(&variants, bucket, self.bucket_size)
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "bucket {} maps to no variant in experiment {}",
                    bucket, experiment_id
                ))
            })?;

        let mut tx = self.pool.begin().await?;
        user_repo::ensure_user(&mut tx, user_id).await?;

        let now = chrono::Utc::now();
        let inserted = assignment_repo::insert_if_absent(
            &mut tx,
            experiment_id,
            user_id,
            variant.id,
            experiment.version,
            "hash",
            enroll.then_some(now),
        )
        .await?;

        match inserted {
            Some(assignment) => {
                self.outbox
                    .insert(
                        &mut tx,
                        &NewOutboxRecord::new(
                            "assignment",
                            aggregate_id(experiment_id, user_id),
                            "assignment.created",
                            created_payload(&assignment, variant, enroll),
                        ),
                    )
                    .await?;

                if enroll {
                    self.outbox
                        .insert(
                            &mut tx,
                            &NewOutboxRecord::new(
                                "assignment",
                                aggregate_id(experiment_id, user_id),
                                "assignment.enrolled",
                                json!({
                                    "experiment_id": experiment_id,
                                    "user_id": user_id,
                                    "variant_id": assignment.variant_id,
                                    "enrolled_at": assignment.enrolled_at,
                                }),
                            ),
                        )
                        .await?;
                }

                tx.commit().await?;
                metrics::ASSIGNMENTS_CREATED.inc();
                debug!(
                    experiment_id,
                    user_id, variant_id = assignment.variant_id, "Assignment created"
                );
            }
            None => {
                // Lost the race: the first writer's variant wins, we only
                // piggy-back the enrollment if asked for.
                if enroll {
                    if let Some(assignment) =
                        assignment_repo::mark_enrolled(&mut tx, experiment_id, user_id).await?
                    {
                        self.outbox
                            .insert(
                                &mut tx,
                                &NewOutboxRecord::new(
                                    "assignment",
                                    aggregate_id(experiment_id, user_id),
                                    "assignment.enrolled",
                                    json!({
                                        "experiment_id": experiment_id,
                                        "user_id": user_id,
                                        "variant_id": assignment.variant_id,
                                        "enrolled_at": assignment.enrolled_at,
                                    }),
                                ),
                            )
                            .await?;
                    }
                }
                tx.commit().await?;
            }
        }

        // 4. Canonical row out of the store, then fill the cache.
        let view = assignment_repo::find_view(&self.pool, experiment_id, user_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "assignment vanished after insert: exp={} user={}",
                    experiment_id, user_id
                ))
            })?;

        self.fill_cache(&view).await;
        Ok(view)
    }

    /// Assignments for one user across several experiments: one cache
    /// multi-get, one store round-trip for misses, one insert batch for
    /// first-contact experiments.
    pub async fn get_bulk(
        &self,
        user_id: &str,
        experiment_ids: &[i64],
    ) -> Result<HashMap<i64, AssignmentView>> {
        let mut results: HashMap<i64, AssignmentView> = HashMap::new();
        if experiment_ids.is_empty() {
            return Ok(results);
        }

        let cached = match self.cache.get_many(user_id, experiment_ids).await {
            Ok(values) => values,
            Err(e) => {
                warn!("Assignment cache multi-get failed: {}", e);
                vec![None; experiment_ids.len()]
            }
        };

        let mut missing: Vec<i64> = Vec::new();
        for (experiment_id, entry) in experiment_ids.iter().zip(cached.into_iter()) {
            match entry {
                Some(view) => {
                    results.insert(*experiment_id, view);
                }
                None => missing.push(*experiment_id),
            }
        }

        if missing.is_empty() {
            return Ok(results);
        }

        let existing = assignment_repo::find_views_for_user(&self.pool, user_id, &missing).await?;
        let mut to_create: Vec<i64> = missing.clone();
        let mut cache_fill: Vec<AssignmentView> = Vec::new();

        for view in existing {
            to_create.retain(|id| *id != view.experiment_id);
            cache_fill.push(view.clone());
            results.insert(view.experiment_id, view);
        }

        if !to_create.is_empty() {
            let created = self.assign_many(user_id, &to_create).await?;
            for view in created {
                cache_fill.push(view.clone());
                results.insert(view.experiment_id, view);
            }
        }

        if !cache_fill.is_empty() {
            if let Err(e) = self.cache.set_many(&cache_fill).await {
                warn!("Assignment cache multi-set failed: {}", e);
            }
        }

        Ok(results)
    }

    /// First-contact inserts for several experiments in one transaction.
    /// Non-active experiments are skipped, not errors: the response map just
    /// omits them.
    async fn assign_many(&self, user_id: &str, experiment_ids: &[i64]) -> Result<Vec<AssignmentView>> {
        let mut chosen: Vec<(Experiment, Variant)> = Vec::new();

        for experiment_id in experiment_ids {
            match self.load_active_experiment(*experiment_id).await {
                Ok((experiment, variants)) => {
                    let bucket = hashing::bucket(
                        user_id,
                        &experiment.seed,
                        &self.hash_seed,
                        self.bucket_size,
                    );
                    if let Some(variant) =
                        hashing::choose_variant(&variants, bucket, self.bucket_size)
                    {
                        chosen.push((experiment, variant.clone()));
                    }
                }
                Err(AppError::NotFound(_)) | Err(AppError::PreconditionFailed(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        if chosen.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        user_repo::ensure_user(&mut tx, user_id).await?;

        let mut assigned_ids: Vec<i64> = Vec::new();
        for (experiment, variant) in &chosen {
            let inserted = assignment_repo::insert_if_absent(
                &mut tx,
                experiment.id,
                user_id,
                variant.id,
                experiment.version,
                "hash",
                None,
            )
            .await?;

            if let Some(assignment) = inserted {
                self.outbox
                    .insert(
                        &mut tx,
                        &NewOutboxRecord::new(
                            "assignment",
                            aggregate_id(experiment.id, user_id),
                            "assignment.created",
                            created_payload(&assignment, variant, false),
                        ),
                    )
                    .await?;
                assigned_ids.push(experiment.id);
                metrics::ASSIGNMENTS_CREATED.inc();
            } else {
                assigned_ids.push(experiment.id);
            }
        }

        tx.commit().await?;

        let views =
            assignment_repo::find_views_for_user(&self.pool, user_id, &assigned_ids).await?;
        Ok(views)
    }

    /// Enroll an already-assigned user. Idempotent: a second call leaves the
    /// original enrolled_at untouched.
    async fn enroll_and_refresh(&self, mut view: AssignmentView) -> Result<AssignmentView> {
        let mut tx = self.pool.begin().await?;

        if let Some(assignment) =
            assignment_repo::mark_enrolled(&mut tx, view.experiment_id, &view.user_id).await?
        {
            record_outbox!(
                &mut tx,
                &*self.outbox,
                "assignment",
                aggregate_id(view.experiment_id, &view.user_id),
                "assignment.enrolled",
                json!({
                    "experiment_id": view.experiment_id,
                    "user_id": view.user_id,
                    "variant_id": assignment.variant_id,
                    "enrolled_at": assignment.enrolled_at,
                })
            )?;
            tx.commit().await?;
            view.enrolled_at = assignment.enrolled_at;
        } else {
            // Another caller enrolled concurrently; read the winning value.
            tx.rollback().await?;
            if let Some(fresh) =
                assignment_repo::find_view(&self.pool, view.experiment_id, &view.user_id).await?
            {
                view = fresh;
            }
        }

        self.fill_cache(&view).await;
        Ok(view)
    }

    async fn load_active_experiment(
        &self,
        experiment_id: i64,
    ) -> Result<(Experiment, Vec<Variant>)> {
        let experiment = experiment_repo::find_experiment(&self.pool, experiment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))?;

        if experiment.status != ExperimentStatus::Active {
            return Err(AppError::PreconditionFailed(format!(
                "experiment {} is not active (status: {})",
                experiment_id,
                experiment.status.as_str()
            )));
        }

        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;
        if variants.is_empty() {
            return Err(AppError::Internal(format!(
                "active experiment {} has no variants",
                experiment_id
            )));
        }

        Ok((experiment, variants))
    }

    async fn fill_cache(&self, view: &AssignmentView) {
        if let Err(e) = self.cache.set(view).await {
            warn!("Assignment cache write failed: {}", e);
        }
    }
}
