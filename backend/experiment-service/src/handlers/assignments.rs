/// Assignment handlers - sticky variant decisions
use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::Result;
use crate::middleware::require_scope;
use crate::models::{AuthContext, BulkAssignmentQuery};
use crate::services::AssignmentService;

#[derive(Debug, Deserialize)]
pub struct AssignmentQuery {
    #[serde(default)]
    pub enroll: bool,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Get (or create) the sticky assignment for a user in an experiment
pub async fn get_assignment(
    assignments: web::Data<AssignmentService>,
    ctx: AuthContext,
    path: web::Path<(i64, String)>,
    query: web::Query<AssignmentQuery>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "assignments:read")?;

    let (experiment_id, user_id) = path.into_inner();
    let view = assignments
        .get_or_assign(experiment_id, &user_id, query.enroll, query.force_refresh)
        .await?;

    Ok(HttpResponse::Ok().json(view))
}

/// Assignments for one user across several experiments; the response map
/// omits experiments that are missing or not active
pub async fn bulk_assignments(
    assignments: web::Data<AssignmentService>,
    ctx: AuthContext,
    req: web::Json<BulkAssignmentQuery>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "assignments:read")?;

    let map = assignments
        .get_bulk(&req.user_id, &req.experiment_ids)
        .await?;

    Ok(HttpResponse::Ok().json(map))
}
