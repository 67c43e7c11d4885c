/// Domain models for the experimentation platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "experiment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Experiment {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperimentStatus,
    /// Stable hashing seed; never changes after creation
    pub seed: String,
    /// Bumped on every Draft->Active transition and allocation edit
    pub version: i32,
    pub config: serde_json::Value,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Variant {
    pub id: i64,
    pub experiment_id: i64,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    /// Percentage allocation (0-100)
    pub allocation_pct: i32,
    pub is_control: bool,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub properties: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Assignment {
    pub id: i64,
    pub experiment_id: i64,
    pub user_id: String,
    pub variant_id: i64,
    /// Experiment version at assignment time
    pub version: i32,
    /// hash | override | forced
    pub source: String,
    pub context: serde_json::Value,
    pub assigned_at: DateTime<Utc>,
    /// First exposure time; once set it never clears
    pub enrolled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Assignment joined with its variant and experiment, as handed to callers
/// and stored in the assignment cache.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssignmentView {
    pub experiment_id: i64,
    pub experiment_key: String,
    pub user_id: String,
    pub variant_id: i64,
    pub variant_key: String,
    pub variant_name: String,
    pub is_control: bool,
    pub assigned_at: DateTime<Utc>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: Uuid,
    pub experiment_id: i64,
    pub user_id: String,
    /// Denormalized from the assignment at write time
    pub variant_id: Option<i64>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// Denormalized assignment timestamp; events before it are stored but
    /// excluded from metrics
    pub assignment_at: Option<DateTime<Utc>>,
    pub properties: serde_json::Value,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl Event {
    /// Only events at-or-after assignment time count toward metrics.
    pub fn is_valid(&self) -> bool {
        match self.assignment_at {
            Some(assignment_at) => self.timestamp >= assignment_at,
            None => false,
        }
    }
}

/// Time bucketing for analytics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Realtime,
    Hour,
    Day,
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::Day
    }
}

impl Granularity {
    /// date_trunc precision, None for raw timestamps
    pub fn trunc_unit(&self) -> Option<&'static str> {
        match self {
            Granularity::Realtime => None,
            Granularity::Hour => Some("hour"),
            Granularity::Day => Some("day"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Realtime => "realtime",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

/// Auth context resolved by the bearer-token middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_id: i64,
    pub scopes: Vec<String>,
    pub rate_limit: Option<i32>,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "admin")
    }
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateVariantRequest {
    #[validate(length(min = 1, max = 255))]
    pub key: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 0, max = 100))]
    pub allocation_pct: i32,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateExperimentRequest {
    #[validate(length(min = 1, max = 255))]
    pub key: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    /// Defaults to the experiment key when absent
    pub seed: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    #[validate(length(min = 1))]
    pub variants: Vec<CreateVariantRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateExperimentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResponse {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkAssignmentQuery {
    pub user_id: String,
    pub experiment_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecordEventRequest {
    pub experiment_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub user_id: String,
    #[validate(length(min = 1, max = 50))]
    pub event_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub id: Uuid,
    pub experiment_id: i64,
    pub user_id: String,
    pub variant_id: i64,
    pub variant_key: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEventResponse {
    pub recorded: usize,
    pub failed: usize,
    pub events: Vec<RecordedEvent>,
    pub errors: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_at_assignment_time_is_valid() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let event = Event {
            id: Uuid::new_v4(),
            experiment_id: 1,
            user_id: "user_1".to_string(),
            variant_id: Some(1),
            event_type: "conversion".to_string(),
            timestamp: at,
            assignment_at: Some(at),
            properties: serde_json::json!({}),
            session_id: None,
            request_id: None,
        };
        assert!(event.is_valid());
    }

    #[test]
    fn event_before_assignment_is_invalid() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let event = Event {
            id: Uuid::new_v4(),
            experiment_id: 1,
            user_id: "user_1".to_string(),
            variant_id: Some(1),
            event_type: "conversion".to_string(),
            timestamp: at - chrono::Duration::seconds(1),
            assignment_at: Some(at),
            properties: serde_json::json!({}),
            session_id: None,
            request_id: None,
        };
        assert!(!event.is_valid());
    }

    #[test]
    fn admin_scope_implies_everything() {
        let ctx = AuthContext {
            token_id: 1,
            scopes: vec!["admin".to_string()],
            rate_limit: None,
        };
        assert!(ctx.has_scope("experiments:write"));
        assert!(ctx.has_scope("analytics:read"));
    }
}
