//! Prometheus metrics for the experiment service.
//!
//! Collectors for the assignment and event hot paths plus an HTTP handler
//! for the `/metrics` endpoint. The outbox drainer registers its own gauges
//! through the outbox library.

use actix_web::HttpResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Total assignments created through the hashing path.
    pub static ref ASSIGNMENTS_CREATED: IntCounter = register_int_counter!(
        "assignments_created_total",
        "Total sticky assignments created"
    )
    .expect("failed to register assignments_created_total");

    /// Assignment cache events (hit/miss/error).
    pub static ref ASSIGNMENT_CACHE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "assignment_cache_events_total",
        "Assignment cache events segmented by outcome",
        &["event"]
    )
    .expect("failed to register assignment_cache_events_total");

    /// Events recorded, segmented by type and validity.
    pub static ref EVENTS_RECORDED: IntCounterVec = register_int_counter_vec!(
        "events_recorded_total",
        "Events recorded segmented by event type and validity",
        &["event_type", "valid"]
    )
    .expect("failed to register events_recorded_total");

    /// Batch ingestion outcomes (committed/rolled_back).
    pub static ref EVENT_BATCHES: IntCounterVec = register_int_counter_vec!(
        "event_batches_total",
        "Event batches segmented by outcome",
        &["outcome"]
    )
    .expect("failed to register event_batches_total");

    /// Analytics query duration by source (operational, analytical, cache).
    pub static ref RESULTS_QUERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "results_query_duration_seconds",
        "Experiment results query duration segmented by data source",
        &["source"]
    )
    .expect("failed to register results_query_duration_seconds");
}

/// Actix handler that renders Prometheus metrics in text format.
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
