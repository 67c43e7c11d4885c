/// Administrative handlers - bulk writes and retention
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::jobs::PartitionManager;
use crate::middleware::require_scope;
use crate::models::{AuthContext, CreateExperimentRequest, RecordEventRequest};
use crate::services::bulk::{AssignmentPatch, BulkAssignmentSpec};
use crate::services::{BulkService, EventsService};

#[derive(Debug, Deserialize)]
pub struct BulkAssignmentUpdateRequest {
    pub assignment_ids: Vec<i64>,
    pub patch: AssignmentPatch,
}

#[derive(Debug, Deserialize)]
pub struct BulkAssignmentDeleteRequest {
    pub assignment_ids: Vec<i64>,
}

/// Create several Draft experiments atomically
pub async fn bulk_create_experiments(
    bulk: web::Data<BulkService>,
    ctx: AuthContext,
    req: web::Json<Vec<CreateExperimentRequest>>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    let outcome = bulk.create_experiments(req.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(outcome))
}

/// Administrative assignment override: upserts rows, bypassing the hasher
pub async fn bulk_upsert_assignments(
    bulk: web::Data<BulkService>,
    ctx: AuthContext,
    req: web::Json<Vec<BulkAssignmentSpec>>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "assignments:write")?;
    let outcome = bulk.upsert_assignments(req.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(outcome))
}

/// Patch a set of assignments with one statement
pub async fn bulk_update_assignments(
    bulk: web::Data<BulkService>,
    ctx: AuthContext,
    req: web::Json<BulkAssignmentUpdateRequest>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "assignments:write")?;
    let req = req.into_inner();
    let outcome = bulk.update_assignments(&req.assignment_ids, req.patch).await?;
    Ok(HttpResponse::Accepted().json(outcome))
}

/// Delete a set of assignments with one statement
pub async fn bulk_delete_assignments(
    bulk: web::Data<BulkService>,
    ctx: AuthContext,
    req: web::Json<BulkAssignmentDeleteRequest>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "assignments:write")?;
    let outcome = bulk.delete_assignments(&req.assignment_ids).await?;
    Ok(HttpResponse::Accepted().json(outcome))
}

/// Bulk event ingestion through the same all-or-nothing batch path
pub async fn bulk_record_events(
    events: web::Data<EventsService>,
    ctx: AuthContext,
    req: web::Json<Vec<RecordEventRequest>>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "events:write")?;
    let response = events.record_batch(req.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(response))
}

/// Trigger a retention pass; reports how many partitions were dropped
pub async fn run_retention(
    partitions: web::Data<Arc<PartitionManager>>,
    ctx: AuthContext,
) -> Result<HttpResponse> {
    require_scope(&ctx, "experiments:write")?;
    let dropped = partitions.apply_retention().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "partitions_dropped": dropped })))
}
