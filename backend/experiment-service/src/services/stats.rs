/// Statistical primitives for experiment analysis.
///
/// All proportions are 64-bit floats. Undefined ratios map to 0 and callers
/// flag the variant's sample adequacy instead of erroring.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use statrs::distribution::{ContinuousCDF, Normal};

static STD_NORMAL: Lazy<Normal> =
    Lazy::new(|| Normal::new(0.0, 1.0).expect("standard normal parameters are valid"));

/// Wilson score interval for a binomial proportion, clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WilsonInterval {
    pub lower: f64,
    pub upper: f64,
}

pub fn wilson_interval(successes: u64, trials: u64, confidence: f64) -> WilsonInterval {
    if trials == 0 {
        return WilsonInterval {
            lower: 0.0,
            upper: 0.0,
        };
    }

    let n = trials as f64;
    let p = successes as f64 / n;
    let z = STD_NORMAL.inverse_cdf((1.0 + confidence) / 2.0);

    let denominator = 1.0 + z * z / n;
    let center = (p + z * z / (2.0 * n)) / denominator;
    let margin = z * ((p * (1.0 - p) / n + z * z / (4.0 * n * n)).sqrt()) / denominator;

    WilsonInterval {
        lower: (center - margin).max(0.0),
        upper: (center + margin).min(1.0),
    }
}

/// Two-tailed p-value of a pooled two-proportion z-test.
///
/// Group 1 is control, group 2 is treatment. Returns 1.0 when either group is
/// empty or the pooled standard error vanishes.
pub fn two_proportion_p_value(s1: u64, n1: u64, s2: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }

    let (s1, n1, s2, n2) = (s1 as f64, n1 as f64, s2 as f64, n2 as f64);
    let pooled = (s1 + s2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();

    if se == 0.0 {
        return 1.0;
    }

    let z = (s2 / n2 - s1 / n1) / se;
    2.0 * (1.0 - STD_NORMAL.cdf(z.abs()))
}

/// Relative lift of a treatment rate over the control rate.
///
/// Undefined (None) when the control rate is zero.
pub fn lift_vs_control(treatment_rate: f64, control_rate: f64) -> Option<f64> {
    if control_rate > 0.0 {
        Some((treatment_rate - control_rate) / control_rate)
    } else {
        None
    }
}

/// Post-hoc statistical power via Cohen's h for two proportions.
pub fn statistical_power(n1: u64, n2: u64, p1: f64, p2: f64, alpha: f64) -> f64 {
    if n1 == 0 || n2 == 0 || p1 == p2 {
        return 0.0;
    }

    let h = 2.0 * (p2.sqrt().asin() - p1.sqrt().asin());
    let n = 2.0 * n1 as f64 * n2 as f64 / (n1 as f64 + n2 as f64);
    let z_alpha = STD_NORMAL.inverse_cdf(1.0 - alpha / 2.0);
    let z_beta = h.abs() * (n / 2.0).sqrt() - z_alpha;

    STD_NORMAL.cdf(z_beta)
}

/// Number of ordered funnel steps a user completed.
///
/// `events` must be sorted by timestamp ascending; a step counts only when it
/// occurs at-or-after the previous step (non-decreasing timestamps come free
/// from the sort, the scan enforces step order).
pub fn funnel_steps_completed(events: &[(String, DateTime<Utc>)], steps: &[String]) -> usize {
    let mut reached = 0;
    for (event_type, _) in events {
        if reached >= steps.len() {
            break;
        }
        if *event_type == steps[reached] {
            reached += 1;
        }
    }
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn wilson_interval_brackets_the_point_estimate() {
        for (s, n) in [(0u64, 100u64), (5, 100), (50, 100), (95, 100), (100, 100)] {
            let ci = wilson_interval(s, n, 0.95);
            let p = s as f64 / n as f64;
            assert!(ci.lower >= 0.0, "s={} n={}", s, n);
            assert!(ci.lower <= p + 1e-12, "s={} n={}", s, n);
            assert!(ci.upper >= p - 1e-12, "s={} n={}", s, n);
            assert!(ci.upper <= 1.0, "s={} n={}", s, n);
        }
    }

    #[test]
    fn wilson_interval_zero_trials_is_degenerate() {
        let ci = wilson_interval(0, 0, 0.95);
        assert_eq!(ci.lower, 0.0);
        assert_eq!(ci.upper, 0.0);
    }

    #[test]
    fn wilson_interval_narrows_with_sample_size() {
        let small = wilson_interval(10, 100, 0.95);
        let large = wilson_interval(1_000, 10_000, 0.95);
        assert!((large.upper - large.lower) < (small.upper - small.lower));
    }

    #[test]
    fn equal_proportions_are_not_significant() {
        let p = two_proportion_p_value(50, 1_000, 50, 1_000);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn large_difference_is_significant() {
        let p = two_proportion_p_value(50, 1_000, 150, 1_000);
        assert!(p < 0.001, "p = {}", p);
    }

    #[test]
    fn p_value_defaults_to_one_without_samples() {
        assert_eq!(two_proportion_p_value(0, 0, 10, 100), 1.0);
        assert_eq!(two_proportion_p_value(0, 100, 0, 100), 1.0);
    }

    #[test]
    fn lift_is_relative_to_control() {
        let lift = lift_vs_control(0.12, 0.10).unwrap();
        assert!((lift - 0.2).abs() < 1e-12, "lift = {}", lift);
        assert_eq!(lift_vs_control(0.10, 0.0), None);
    }

    #[test]
    fn power_grows_with_sample_size() {
        let small = statistical_power(100, 100, 0.10, 0.15, 0.05);
        let large = statistical_power(10_000, 10_000, 0.10, 0.15, 0.05);
        assert!(large > small);
        assert!(large > 0.99);
    }

    #[test]
    fn power_is_zero_without_an_effect() {
        assert_eq!(statistical_power(1_000, 1_000, 0.10, 0.10, 0.05), 0.0);
        assert_eq!(statistical_power(0, 1_000, 0.10, 0.15, 0.05), 0.0);
    }

    #[test]
    fn funnel_counts_steps_in_order() {
        let steps = vec!["exposure".to_string(), "click".to_string(), "conversion".to_string()];

        let complete = vec![
            ("exposure".to_string(), ts(0)),
            ("click".to_string(), ts(1)),
            ("conversion".to_string(), ts(2)),
        ];
        assert_eq!(funnel_steps_completed(&complete, &steps), 3);

        // Conversion before the click does not satisfy step order.
        let out_of_order = vec![
            ("exposure".to_string(), ts(0)),
            ("conversion".to_string(), ts(1)),
            ("click".to_string(), ts(2)),
        ];
        assert_eq!(funnel_steps_completed(&out_of_order, &steps), 2);

        let partial = vec![("exposure".to_string(), ts(0))];
        assert_eq!(funnel_steps_completed(&partial, &steps), 1);

        assert_eq!(funnel_steps_completed(&[], &steps), 0);
    }

    #[test]
    fn funnel_allows_repeated_and_interleaved_events() {
        let steps = vec!["exposure".to_string(), "conversion".to_string()];
        let events = vec![
            ("click".to_string(), ts(0)),
            ("exposure".to_string(), ts(1)),
            ("exposure".to_string(), ts(2)),
            ("conversion".to_string(), ts(3)),
        ];
        assert_eq!(funnel_steps_completed(&events, &steps), 2);
    }
}
