/// Analytics handlers - experiment results and funnels
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::middleware::require_scope;
use crate::models::{AuthContext, Granularity};
use crate::services::analytics::ResultsQuery;
use crate::services::AnalyticsService;

#[derive(Debug, Deserialize)]
pub struct ResultsParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Comma-separated event types
    pub event_types: Option<String>,
    pub granularity: Option<Granularity>,
    pub include_ci: Option<bool>,
    pub min_sample: Option<u64>,
    /// URL-encoded JSON object of property key/value equality filters
    pub filters: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FunnelParams {
    /// Comma-separated ordered step event types
    pub steps: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

fn split_csv(value: &Option<String>) -> Option<Vec<String>> {
    value
        .as_ref()
        .map(|s| {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect::<Vec<String>>()
        })
        .filter(|parts| !parts.is_empty())
}

/// Per-variant metrics with statistical inference over a time window
pub async fn get_results(
    analytics: web::Data<AnalyticsService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
    params: web::Query<ResultsParams>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "analytics:read")?;

    let property_filter = match &params.filters {
        Some(raw) => {
            let parsed: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| AppError::Validation(format!("invalid filters JSON: {}", e)))?;
            if !parsed.is_object() {
                return Err(AppError::Validation(
                    "filters must be a JSON object".to_string(),
                ));
            }
            Some(parsed)
        }
        None => None,
    };

    let query = ResultsQuery {
        start: params.start,
        end: params.end,
        event_types: split_csv(&params.event_types),
        granularity: params.granularity.unwrap_or_default(),
        include_ci: params.include_ci.unwrap_or(true),
        min_sample: params.min_sample,
        property_filter,
    };

    let results = analytics.experiment_results(*experiment_id, query).await?;
    Ok(HttpResponse::Ok().json(results))
}

/// Funnel conversion per variant over ordered steps
pub async fn get_funnel(
    analytics: web::Data<AnalyticsService>,
    ctx: AuthContext,
    experiment_id: web::Path<i64>,
    params: web::Query<FunnelParams>,
) -> Result<HttpResponse> {
    require_scope(&ctx, "analytics:read")?;

    let steps: Vec<String> = params
        .steps
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let report = analytics
        .funnel(*experiment_id, steps, params.start, params.end)
        .await?;
    Ok(HttpResponse::Ok().json(report))
}
