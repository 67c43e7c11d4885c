/// Event ingestion with the transactional outbox.
///
/// Every event is stamped with the assignment snapshot (`variant_id`,
/// `assignment_at`) at write time, and the event row plus its outbox record
/// commit atomically. Events that precede their assignment are stored but
/// flagged invalid; the read path filters them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::warn;
use transactional_outbox::{NewOutboxRecord, OutboxRepository, SqlxOutboxRepository};
use uuid::Uuid;

use crate::cache::RealtimeCounters;
use crate::db::{assignment_repo, event_repo};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{
    AssignmentView, BatchEventResponse, Event, RecordEventRequest, RecordedEvent,
};
use crate::services::assignment::AssignmentService;

/// Hard cap on batch ingestion size.
pub const MAX_BATCH_SIZE: usize = 1_000;

pub struct EventsService {
    pool: PgPool,
    assignments: Arc<AssignmentService>,
    outbox: Arc<SqlxOutboxRepository>,
    realtime: RealtimeCounters,
}

fn event_payload(event: &Event, variant_key: &str, is_valid: bool) -> serde_json::Value {
    json!({
        "id": event.id,
        "experiment_id": event.experiment_id,
        "user_id": event.user_id,
        "variant_id": event.variant_id,
        "variant_key": variant_key,
        "event_type": event.event_type,
        "timestamp": event.timestamp,
        "assignment_at": event.assignment_at,
        "properties": event.properties,
        "is_valid": is_valid,
    })
}

impl EventsService {
    pub fn new(
        pool: PgPool,
        assignments: Arc<AssignmentService>,
        outbox: Arc<SqlxOutboxRepository>,
        realtime: RealtimeCounters,
    ) -> Self {
        Self {
            pool,
            assignments,
            outbox,
            realtime,
        }
    }

    /// Record one event. Resolves (or creates) the assignment first so the
    /// denormalized snapshot is always well-defined; exposure events enroll
    /// the user.
    pub async fn record(&self, req: RecordEventRequest) -> Result<RecordedEvent> {
        let timestamp = req.timestamp.unwrap_or_else(Utc::now);

        let assignment = self
            .assignments
            .get_or_assign(
                req.experiment_id,
                &req.user_id,
                req.event_type == "exposure",
                false,
            )
            .await?;

        let event = Event {
            id: Uuid::new_v4(),
            experiment_id: req.experiment_id,
            user_id: req.user_id.clone(),
            variant_id: Some(assignment.variant_id),
            event_type: req.event_type.clone(),
            timestamp,
            assignment_at: Some(assignment.assigned_at),
            properties: req.properties.clone(),
            session_id: req.session_id.clone(),
            request_id: req.request_id.clone(),
        };
        let is_valid = timestamp >= assignment.assigned_at;

        let mut tx = self.pool.begin().await?;
        event_repo::insert_event(&mut tx, &event).await?;
        self.outbox
            .insert(
                &mut tx,
                &NewOutboxRecord::new(
                    "event",
                    event.id.to_string(),
                    "event.created",
                    event_payload(&event, &assignment.variant_key, is_valid),
                ),
            )
            .await?;
        tx.commit().await?;

        metrics::EVENTS_RECORDED
            .with_label_values(&[req.event_type.as_str(), if is_valid { "true" } else { "false" }])
            .inc();

        self.realtime
            .record(
                event.experiment_id,
                assignment.variant_id,
                &event.event_type,
                &event.user_id,
                timestamp,
            )
            .await;

        Ok(RecordedEvent {
            id: event.id,
            experiment_id: event.experiment_id,
            user_id: event.user_id,
            variant_id: assignment.variant_id,
            variant_key: assignment.variant_key,
            event_type: event.event_type,
            timestamp,
            is_valid,
        })
    }

    /// Record up to [`MAX_BATCH_SIZE`] events with one set-oriented insert
    /// plus one set-oriented outbox insert, all-or-nothing.
    ///
    /// The batch path does not create users or assignments: rows without an
    /// existing assignment are stored without the snapshot (invalid for
    /// metrics), and a row referencing a missing user aborts the whole batch
    /// at the foreign key. Per-row validation belongs above this layer.
    pub async fn record_batch(&self, requests: Vec<RecordEventRequest>) -> Result<BatchEventResponse> {
        if requests.is_empty() {
            return Ok(BatchEventResponse {
                recorded: 0,
                failed: 0,
                events: Vec::new(),
                errors: Vec::new(),
            });
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(AppError::Validation(format!(
                "batch size {} exceeds the maximum of {}",
                requests.len(),
                MAX_BATCH_SIZE
            )));
        }

        let assignments = self.prefetch_assignments(&requests).await?;

        let now = Utc::now();
        let mut events: Vec<Event> = Vec::with_capacity(requests.len());
        let mut outbox_records: Vec<NewOutboxRecord> = Vec::with_capacity(requests.len());
        let mut recorded: Vec<RecordedEvent> = Vec::with_capacity(requests.len());

        for req in &requests {
            let assignment = assignments.get(&(req.experiment_id, req.user_id.clone()));
            let timestamp = req.timestamp.unwrap_or(now);

            let event = Event {
                id: Uuid::new_v4(),
                experiment_id: req.experiment_id,
                user_id: req.user_id.clone(),
                variant_id: assignment.map(|a| a.variant_id),
                event_type: req.event_type.clone(),
                timestamp,
                assignment_at: assignment.map(|a| a.assigned_at),
                properties: req.properties.clone(),
                session_id: req.session_id.clone(),
                request_id: req.request_id.clone(),
            };

            let is_valid = event.is_valid();
            let variant_key = assignment.map(|a| a.variant_key.as_str()).unwrap_or("");

            outbox_records.push(NewOutboxRecord::new(
                "event",
                event.id.to_string(),
                "event.created",
                event_payload(&event, variant_key, is_valid),
            ));

            recorded.push(RecordedEvent {
                id: event.id,
                experiment_id: event.experiment_id,
                user_id: event.user_id.clone(),
                variant_id: assignment.map(|a| a.variant_id).unwrap_or(0),
                variant_key: variant_key.to_string(),
                event_type: event.event_type.clone(),
                timestamp,
                is_valid,
            });

            events.push(event);
        }

        let commit_result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            event_repo::insert_events(&mut tx, &events).await?;
            self.outbox.insert_many(&mut tx, &outbox_records).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match commit_result {
            Ok(()) => {
                metrics::EVENT_BATCHES.with_label_values(&["committed"]).inc();
                for event in recorded.iter().filter(|e| e.is_valid) {
                    self.realtime
                        .record(
                            event.experiment_id,
                            event.variant_id,
                            &event.event_type,
                            &event.user_id,
                            event.timestamp,
                        )
                        .await;
                }

                Ok(BatchEventResponse {
                    recorded: recorded.len(),
                    failed: 0,
                    events: recorded,
                    errors: Vec::new(),
                })
            }
            Err(e) => {
                // One constraint violation rolls back the whole batch; the
                // caller can retry with the offending rows removed.
                metrics::EVENT_BATCHES.with_label_values(&["rolled_back"]).inc();
                warn!("Event batch rolled back: {}", e);

                Ok(BatchEventResponse {
                    recorded: 0,
                    failed: requests.len(),
                    events: Vec::new(),
                    errors: vec![json!({ "error": e.to_string(), "batch": requests.len() })],
                })
            }
        }
    }

    /// Existing assignment snapshots for every (experiment, user) pair in the
    /// batch, one query per distinct user.
    async fn prefetch_assignments(
        &self,
        requests: &[RecordEventRequest],
    ) -> Result<HashMap<(i64, String), AssignmentView>> {
        let mut by_user: HashMap<&str, Vec<i64>> = HashMap::new();
        for req in requests {
            let experiments = by_user.entry(req.user_id.as_str()).or_default();
            if !experiments.contains(&req.experiment_id) {
                experiments.push(req.experiment_id);
            }
        }

        let mut snapshots = HashMap::new();
        for (user_id, experiment_ids) in by_user {
            let views =
                assignment_repo::find_views_for_user(&self.pool, user_id, &experiment_ids).await?;
            for view in views {
                snapshots.insert((view.experiment_id, view.user_id.clone()), view);
            }
        }

        Ok(snapshots)
    }
}
