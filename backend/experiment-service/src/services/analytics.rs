/// Dual-path experiment analytics.
///
/// Recent, narrow windows are answered from the operational row store;
/// historical or wide windows from the analytical rollup. Both paths apply
/// the post-assignment filter and produce the same report schema, and the
/// results cache key includes the experiment version so allocation changes
/// invalidate stale reports automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::cache::ResultsCache;
use crate::db::{event_repo, experiment_repo, rollup_repo, ClickHouseClient};
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{Experiment, Granularity, Variant};
use crate::services::stats;

/// Which store answers a results query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    Operational,
    Analytical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleAdequacy {
    Adequate,
    Insufficient,
}

/// Parsed results query.
#[derive(Debug, Clone, Default)]
pub struct ResultsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_types: Option<Vec<String>>,
    pub granularity: Granularity,
    pub include_ci: bool,
    pub min_sample: Option<u64>,
    pub property_filter: Option<serde_json::Value>,
}

/// Normalized per-variant totals, whichever store produced them.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantTotals {
    pub event_count: u64,
    pub unique_users: u64,
    pub conversions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub variant_id: i64,
    pub variant_key: String,
    pub variant_name: String,
    pub is_control: bool,
    pub unique_users: u64,
    pub event_count: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub sample_adequacy: SampleAdequacy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lift_vs_control: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_significant: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePoint {
    pub time: String,
    pub variant_id: i64,
    pub event_type: String,
    pub event_count: u64,
    pub unique_users: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_users: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning_variant: Option<String>,
    pub best_conversion_rate: f64,
    pub statistical_power: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: i64,
    pub experiment_key: String,
    pub experiment_name: String,
    pub status: String,
    pub source: QuerySource,
    pub time_range: TimeRange,
    pub variants: Vec<VariantMetrics>,
    pub time_series: Vec<TimePoint>,
    pub summary: ResultsSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelStepReport {
    pub step: String,
    pub step_order: usize,
    pub users_reached: u64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelVariantReport {
    pub variant_id: i64,
    pub variant_key: String,
    pub steps: Vec<FunnelStepReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelReport {
    pub experiment_id: i64,
    pub funnel_steps: Vec<String>,
    pub variants: Vec<FunnelVariantReport>,
    pub total_users_entered: u64,
    pub total_users_completed: u64,
    pub overall_conversion_rate: f64,
}

/// Pick the store for a window.
///
/// Old or wide windows go to the analytical rollup; anything carrying a
/// property filter must stay operational because rollups do not retain
/// properties.
pub fn route(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    recent_window: Duration,
    max_operational_span: Duration,
    has_property_filter: bool,
) -> QuerySource {
    if has_property_filter {
        return QuerySource::Operational;
    }
    if now - start > recent_window {
        return QuerySource::Analytical;
    }
    if end - start > max_operational_span {
        return QuerySource::Analytical;
    }
    QuerySource::Operational
}

/// Per-variant statistics over normalized totals.
///
/// Variants below `min_sample` keep their raw totals but are excluded from
/// CI, lift and p-value output.
pub fn compute_variant_metrics(
    variants: &[Variant],
    totals: &HashMap<i64, VariantTotals>,
    min_sample: u64,
    confidence: f64,
    include_ci: bool,
) -> Vec<VariantMetrics> {
    let control = variants.iter().find(|v| v.is_control);
    let control_totals = control
        .and_then(|c| totals.get(&c.id).copied())
        .unwrap_or_default();
    let control_rate = rate(control_totals);
    let control_adequate = control_totals.unique_users >= min_sample;

    variants
        .iter()
        .map(|variant| {
            let t = totals.get(&variant.id).copied().unwrap_or_default();
            let conversion_rate = rate(t);
            let adequate = t.unique_users >= min_sample;

            let (ci_lower, ci_upper) = if include_ci && adequate {
                let ci = stats::wilson_interval(t.conversions, t.unique_users, confidence);
                (Some(ci.lower), Some(ci.upper))
            } else {
                (None, None)
            };

            let comparable = !variant.is_control && adequate && control_adequate;
            let lift_vs_control = if comparable {
                stats::lift_vs_control(conversion_rate, control_rate)
            } else {
                None
            };
            let p_value = if include_ci && comparable {
                Some(stats::two_proportion_p_value(
                    control_totals.conversions,
                    control_totals.unique_users,
                    t.conversions,
                    t.unique_users,
                ))
            } else {
                None
            };

            VariantMetrics {
                variant_id: variant.id,
                variant_key: variant.key.clone(),
                variant_name: variant.name.clone(),
                is_control: variant.is_control,
                unique_users: t.unique_users,
                event_count: t.event_count,
                conversions: t.conversions,
                conversion_rate,
                sample_adequacy: if adequate {
                    SampleAdequacy::Adequate
                } else {
                    SampleAdequacy::Insufficient
                },
                ci_lower,
                ci_upper,
                lift_vs_control,
                p_value,
                is_significant: p_value.map(|p| p < 0.05),
            }
        })
        .collect()
}

fn rate(t: VariantTotals) -> f64 {
    if t.unique_users == 0 {
        0.0
    } else {
        t.conversions as f64 / t.unique_users as f64
    }
}

/// Summary block with the post-hoc power of the control vs best-treatment
/// pair and a recommendation.
pub fn summarize(metrics: &[VariantMetrics]) -> ResultsSummary {
    let total_users: u64 = metrics.iter().map(|m| m.unique_users).sum();

    let best = metrics
        .iter()
        .filter(|m| m.conversion_rate > 0.0)
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate));

    let control = metrics.iter().find(|m| m.is_control);
    let best_treatment = metrics
        .iter()
        .filter(|m| !m.is_control && m.sample_adequacy == SampleAdequacy::Adequate)
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate));

    let statistical_power = match (control, best_treatment) {
        (Some(c), Some(t)) if c.sample_adequacy == SampleAdequacy::Adequate => {
            stats::statistical_power(
                c.unique_users,
                t.unique_users,
                c.conversion_rate,
                t.conversion_rate,
                0.05,
            )
        }
        _ => 0.0,
    };

    let significant_winner = metrics
        .iter()
        .filter(|m| m.is_significant == Some(true) && m.lift_vs_control.unwrap_or(0.0) > 0.0)
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate));

    let recommendation = if statistical_power < 0.8 {
        "Continue experiment - insufficient statistical power".to_string()
    } else if let Some(winner) = significant_winner {
        format!(
            "Deploy variant '{}' - statistically significant improvement",
            winner.variant_key
        )
    } else {
        "No significant difference detected - consider stopping experiment".to_string()
    };

    ResultsSummary {
        total_users,
        winning_variant: best.map(|m| m.variant_key.clone()),
        best_conversion_rate: best.map(|m| m.conversion_rate).unwrap_or(0.0),
        statistical_power,
        recommendation,
    }
}

pub struct AnalyticsService {
    pool: PgPool,
    ch: Arc<ClickHouseClient>,
    results_cache: ResultsCache,
    recent_window: Duration,
    max_operational_span: Duration,
    default_min_sample: u64,
    confidence: f64,
}

impl AnalyticsService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        ch: Arc<ClickHouseClient>,
        results_cache: ResultsCache,
        recent_window_secs: i64,
        max_operational_span_days: i64,
        default_min_sample: u64,
        confidence: f64,
    ) -> Self {
        Self {
            pool,
            ch,
            results_cache,
            recent_window: Duration::seconds(recent_window_secs),
            max_operational_span: Duration::days(max_operational_span_days),
            default_min_sample,
            confidence,
        }
    }

    pub async fn experiment_results(
        &self,
        experiment_id: i64,
        query: ResultsQuery,
    ) -> Result<ExperimentResults> {
        let experiment = self.require_experiment(experiment_id).await?;
        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;

        let now = Utc::now();
        let end = query.end.unwrap_or(now);
        let start = query.start.unwrap_or(end - Duration::days(7));
        if start > end {
            return Err(AppError::Validation(
                "start must not be after end".to_string(),
            ));
        }

        let min_sample = query.min_sample.unwrap_or(self.default_min_sample);

        let cache_key = ResultsCache::cache_key(
            experiment_id,
            experiment.version,
            start,
            end,
            query.event_types.as_deref(),
            query.granularity,
            min_sample,
            query.include_ci,
            query.property_filter.as_ref(),
        );

        match self.results_cache.get::<ExperimentResults>(&cache_key).await {
            Ok(Some(cached)) => {
                metrics::RESULTS_QUERY_DURATION_SECONDS
                    .with_label_values(&["cache"])
                    .observe(0.0);
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!("Results cache read failed: {}", e),
        }

        let source = route(
            start,
            end,
            now,
            self.recent_window,
            self.max_operational_span,
            query.property_filter.is_some(),
        );

        let started = Instant::now();
        let (totals, time_series) = match source {
            QuerySource::Operational => self.operational_totals(experiment_id, start, end, &query).await?,
            QuerySource::Analytical => self.analytical_totals(experiment_id, start, end, &query).await?,
        };
        metrics::RESULTS_QUERY_DURATION_SECONDS
            .with_label_values(&[match source {
                QuerySource::Operational => "operational",
                QuerySource::Analytical => "analytical",
            }])
            .observe(started.elapsed().as_secs_f64());

        let variant_metrics = compute_variant_metrics(
            &variants,
            &totals,
            min_sample,
            self.confidence,
            query.include_ci,
        );
        let summary = summarize(&variant_metrics);

        let results = ExperimentResults {
            experiment_id,
            experiment_key: experiment.key.clone(),
            experiment_name: experiment.name.clone(),
            status: experiment.status.as_str().to_string(),
            source,
            time_range: TimeRange {
                start,
                end,
                granularity: query.granularity,
            },
            variants: variant_metrics,
            time_series,
            summary,
        };

        if let Err(e) = self.results_cache.set(&cache_key, &results).await {
            warn!("Results cache write failed: {}", e);
        }

        Ok(results)
    }

    /// Funnel conversion per variant over ordered steps. Operational store
    /// only: step ordering needs raw event timestamps.
    pub async fn funnel(
        &self,
        experiment_id: i64,
        steps: Vec<String>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<FunnelReport> {
        if steps.is_empty() {
            return Err(AppError::Validation("funnel needs at least one step".to_string()));
        }

        self.require_experiment(experiment_id).await?;
        let variants = experiment_repo::variants_for(&self.pool, experiment_id).await?;
        let variant_keys: HashMap<i64, String> =
            variants.iter().map(|v| (v.id, v.key.clone())).collect();

        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or(end - Duration::days(30));

        let rows = event_repo::funnel_events(&self.pool, experiment_id, start, end, &steps).await?;

        // Walk each user's ordered events and count how deep they got.
        let mut per_user: HashMap<(i64, String), Vec<(String, DateTime<Utc>)>> = HashMap::new();
        for row in rows {
            per_user
                .entry((row.variant_id, row.user_id))
                .or_default()
                .push((row.event_type, row.timestamp));
        }

        let mut reached: HashMap<i64, Vec<u64>> = HashMap::new();
        for ((variant_id, _user), events) in per_user {
            let depth = stats::funnel_steps_completed(&events, &steps);
            let counts = reached
                .entry(variant_id)
                .or_insert_with(|| vec![0; steps.len()]);
            for step in counts.iter_mut().take(depth) {
                *step += 1;
            }
        }

        let mut variant_reports: Vec<FunnelVariantReport> = Vec::new();
        for variant in &variants {
            let counts = reached
                .get(&variant.id)
                .cloned()
                .unwrap_or_else(|| vec![0; steps.len()]);
            let entered = counts.first().copied().unwrap_or(0);

            let step_reports = steps
                .iter()
                .enumerate()
                .map(|(i, step)| FunnelStepReport {
                    step: step.clone(),
                    step_order: i,
                    users_reached: counts[i],
                    conversion_rate: if entered == 0 {
                        0.0
                    } else {
                        counts[i] as f64 / entered as f64
                    },
                })
                .collect();

            variant_reports.push(FunnelVariantReport {
                variant_id: variant.id,
                variant_key: variant_keys.get(&variant.id).cloned().unwrap_or_default(),
                steps: step_reports,
            });
        }

        let total_entered: u64 = variant_reports
            .iter()
            .filter_map(|v| v.steps.first())
            .map(|s| s.users_reached)
            .sum();
        let total_completed: u64 = variant_reports
            .iter()
            .filter_map(|v| v.steps.last())
            .map(|s| s.users_reached)
            .sum();

        Ok(FunnelReport {
            experiment_id,
            funnel_steps: steps,
            variants: variant_reports,
            total_users_entered: total_entered,
            total_users_completed: total_completed,
            overall_conversion_rate: if total_entered == 0 {
                0.0
            } else {
                total_completed as f64 / total_entered as f64
            },
        })
    }

    async fn operational_totals(
        &self,
        experiment_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        query: &ResultsQuery,
    ) -> Result<(HashMap<i64, VariantTotals>, Vec<TimePoint>)> {
        let rows = event_repo::variant_totals(
            &self.pool,
            experiment_id,
            start,
            end,
            query.event_types.as_deref(),
            query.property_filter.as_ref(),
        )
        .await?;

        let totals = rows
            .into_iter()
            .map(|row| {
                (
                    row.variant_id,
                    VariantTotals {
                        event_count: row.event_count as u64,
                        unique_users: row.unique_users as u64,
                        conversions: row.conversions as u64,
                    },
                )
            })
            .collect();

        let series_rows = event_repo::time_series(
            &self.pool,
            experiment_id,
            start,
            end,
            query.event_types.as_deref(),
            query.property_filter.as_ref(),
            query.granularity,
        )
        .await?;

        let time_series = series_rows
            .into_iter()
            .map(|row| TimePoint {
                time: row.bucket.to_rfc3339(),
                variant_id: row.variant_id,
                event_type: row.event_type,
                event_count: row.event_count as u64,
                unique_users: row.unique_users as u64,
            })
            .collect();

        Ok((totals, time_series))
    }

    async fn analytical_totals(
        &self,
        experiment_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        query: &ResultsQuery,
    ) -> Result<(HashMap<i64, VariantTotals>, Vec<TimePoint>)> {
        let start_day = start.date_naive();
        let end_day = end.date_naive();

        let rows = rollup_repo::variant_totals(
            &self.ch,
            experiment_id,
            start_day,
            end_day,
            query.event_types.as_deref(),
        )
        .await?;

        let totals = rows
            .into_iter()
            .map(|row| {
                (
                    row.variant_id,
                    VariantTotals {
                        event_count: row.event_count,
                        unique_users: row.unique_users,
                        conversions: row.conversions,
                    },
                )
            })
            .collect();

        // Rollups are day-keyed; hour/realtime series degrade to daily here.
        let series_rows = rollup_repo::daily_series(
            &self.ch,
            experiment_id,
            start_day,
            end_day,
            query.event_types.as_deref(),
        )
        .await?;

        let time_series = series_rows
            .into_iter()
            .map(|row| TimePoint {
                time: row.day,
                variant_id: row.variant_id,
                event_type: row.event_type,
                event_count: row.event_count,
                unique_users: row.unique_users,
            })
            .collect();

        Ok((totals, time_series))
    }

    async fn require_experiment(&self, experiment_id: i64) -> Result<Experiment> {
        experiment_repo::find_experiment(&self.pool, experiment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("experiment {} not found", experiment_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn variant(id: i64, key: &str, is_control: bool) -> Variant {
        Variant {
            id,
            experiment_id: 1,
            key: key.to_string(),
            name: key.to_string(),
            description: None,
            allocation_pct: 50,
            is_control,
            config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn totals(event_count: u64, unique_users: u64, conversions: u64) -> VariantTotals {
        VariantTotals {
            event_count,
            unique_users,
            conversions,
        }
    }

    #[test]
    fn recent_narrow_windows_stay_operational() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let start = now - Duration::minutes(30);
        let source = route(start, now, now, Duration::hours(1), Duration::days(30), false);
        assert_eq!(source, QuerySource::Operational);
    }

    #[test]
    fn old_windows_route_to_the_rollup() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let start = now - Duration::hours(2);
        let source = route(start, now, now, Duration::hours(1), Duration::days(30), false);
        assert_eq!(source, QuerySource::Analytical);
    }

    #[test]
    fn wide_windows_route_to_the_rollup() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        // Start inside the recent window but spanning 40 days into the future
        // bounds exercises the span rule alone.
        let start = now - Duration::minutes(10);
        let end = start + Duration::days(40);
        let source = route(start, end, now, Duration::hours(1), Duration::days(30), false);
        assert_eq!(source, QuerySource::Analytical);
    }

    #[test]
    fn property_filters_pin_the_operational_store() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let start = now - Duration::days(20);
        let source = route(start, now, now, Duration::hours(1), Duration::days(30), true);
        assert_eq!(source, QuerySource::Operational);
    }

    #[test]
    fn min_sample_gates_inference_but_not_totals() {
        let variants = vec![variant(1, "control", true), variant(2, "treatment", false)];
        let mut t = HashMap::new();
        t.insert(1, totals(500, 200, 20));
        t.insert(2, totals(80, 40, 10)); // below min_sample

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);

        let treatment = metrics.iter().find(|m| m.variant_id == 2).unwrap();
        assert_eq!(treatment.sample_adequacy, SampleAdequacy::Insufficient);
        assert_eq!(treatment.unique_users, 40);
        assert_eq!(treatment.conversions, 10);
        assert!(treatment.ci_lower.is_none());
        assert!(treatment.p_value.is_none());
        assert!(treatment.lift_vs_control.is_none());

        let control = metrics.iter().find(|m| m.variant_id == 1).unwrap();
        assert_eq!(control.sample_adequacy, SampleAdequacy::Adequate);
        assert!(control.ci_lower.is_some());
    }

    #[test]
    fn lift_and_p_value_compare_against_control() {
        let variants = vec![variant(1, "control", true), variant(2, "treatment", false)];
        let mut t = HashMap::new();
        t.insert(1, totals(2_000, 1_000, 100));
        t.insert(2, totals(2_000, 1_000, 150));

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);
        let treatment = metrics.iter().find(|m| m.variant_id == 2).unwrap();

        let lift = treatment.lift_vs_control.unwrap();
        assert!((lift - 0.5).abs() < 1e-9, "lift = {}", lift);
        assert!(treatment.p_value.unwrap() < 0.05);
        assert_eq!(treatment.is_significant, Some(true));
    }

    #[test]
    fn variants_without_rows_report_zeroes() {
        let variants = vec![variant(1, "control", true), variant(2, "treatment", false)];
        let t = HashMap::new();

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);
        for m in &metrics {
            assert_eq!(m.unique_users, 0);
            assert_eq!(m.conversion_rate, 0.0);
            assert_eq!(m.sample_adequacy, SampleAdequacy::Insufficient);
        }
    }

    #[test]
    fn ci_bounds_stay_in_unit_interval() {
        let variants = vec![variant(1, "control", true)];
        let mut t = HashMap::new();
        t.insert(1, totals(1_000, 1_000, 1_000));

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);
        let m = &metrics[0];
        assert!(m.ci_lower.unwrap() >= 0.0);
        assert!(m.ci_upper.unwrap() <= 1.0);
        assert!(m.ci_lower.unwrap() <= m.conversion_rate);
        assert!(m.ci_upper.unwrap() >= m.conversion_rate);
    }

    #[test]
    fn summary_recommends_more_data_when_underpowered() {
        let variants = vec![variant(1, "control", true), variant(2, "treatment", false)];
        let mut t = HashMap::new();
        t.insert(1, totals(300, 150, 15));
        t.insert(2, totals(300, 150, 17));

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);
        let summary = summarize(&metrics);
        assert!(summary.statistical_power < 0.8);
        assert!(summary.recommendation.contains("insufficient statistical power"));
    }

    #[test]
    fn summary_names_a_significant_winner() {
        let variants = vec![variant(1, "control", true), variant(2, "treatment", false)];
        let mut t = HashMap::new();
        t.insert(1, totals(40_000, 20_000, 2_000));
        t.insert(2, totals(40_000, 20_000, 2_600));

        let metrics = compute_variant_metrics(&variants, &t, 100, 0.95, true);
        let summary = summarize(&metrics);
        assert!(summary.statistical_power >= 0.8);
        assert_eq!(summary.winning_variant.as_deref(), Some("treatment"));
        assert!(summary.recommendation.contains("Deploy variant 'treatment'"));
    }
}
