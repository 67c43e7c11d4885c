/// Event ingestion handlers
use actix_web::{web, HttpResponse};
use validator::Validate;

use crate::error::{AppError, Result};
use crate::middleware::require_scope;
use crate::models::{AuthContext, RecordEventRequest};
use crate::services::EventsService;

/// Record a single event; creates the assignment on first contact and
/// enrolls on exposure events
pub async fn record_event(
    events: web::Data<EventsService>,
    ctx: AuthContext,
    req: web::Json<RecordEventRequest>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "events:write")?;
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let recorded = events.record(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(recorded))
}

/// Record up to 1,000 events atomically; the whole batch commits or none of
/// it does
pub async fn record_event_batch(
    events: web::Data<EventsService>,
    ctx: AuthContext,
    req: web::Json<Vec<RecordEventRequest>>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "events:write")?;
    for event in req.iter() {
        event
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
    }

    let response = events.record_batch(req.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(response))
}
