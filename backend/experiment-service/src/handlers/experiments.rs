/// Experiment handlers - CRUD and lifecycle transitions
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::middleware::require_scope;
use crate::models::{
    AuthContext, CreateExperimentRequest, ExperimentStatus, UpdateExperimentRequest,
};
use crate::services::LifecycleService;

#[derive(Debug, Deserialize)]
pub struct ListExperimentsQuery {
    pub status: Option<ExperimentStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AllocationUpdate {
    pub variant_id: i64,
    pub allocation_pct: i32,
}

/// Create a new experiment in Draft with its variants
pub async fn create_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    req: web::Json<CreateExperimentRequest>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let response = lifecycle.create(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(response))
}

/// Get an experiment with its variants
pub async fn get_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:read")?;
    let response = lifecycle.get(*experiment_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// List experiments, optionally filtered by status
pub async fn list_experiments(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    query: web::Query<ListExperimentsQuery>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:read")?;
    let experiments = lifecycle
        .list(
            query.status,
            query.limit.unwrap_or(50).clamp(1, 500),
            query.offset.unwrap_or(0).max(0),
        )
        .await?;
    Ok(HttpResponse::Ok().json(experiments))
}

/// Patch name/description/config/time window
pub async fn update_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
    req: web::Json<UpdateExperimentRequest>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    let response = lifecycle.update(*experiment_id, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Activate; idempotent for already-active experiments
pub async fn activate_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    let response = lifecycle.activate(*experiment_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Pause an active experiment
pub async fn pause_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    let response = lifecycle.pause(*experiment_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Archive (soft delete)
pub async fn archive_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    lifecycle.archive(*experiment_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Hard delete; cascades to variants and assignments
pub async fn hard_delete_experiment(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    lifecycle.hard_delete(*experiment_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Edit variant allocations; bumps version and invalidates cached assignments
pub async fn update_allocations(
    lifecycle: web::Data<LifecycleService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
    req: web::Json<Vec<AllocationUpdate>>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;

    let allocations: Vec<(i64, i32)> = req
        .iter()
        .map(|u| (u.variant_id, u.allocation_pct))
        .collect();
    let response = lifecycle
        .update_allocations(*experiment_id, &allocations)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}
