//! Robustness-weight sensitivity analysis.
//!
//! The robustness score is a weighted blend of five sub-scores, and the
//! default weighting is a choice, not a law. This module re-scores the
//! walk-forward results under many random weightings and reports how
//! stable the default favorite stays.

use rand::Rng;
use serde::Serialize;

use crate::kpi::robustness_ratio;
use crate::meta::MetaResult;
use crate::types::RatioWeights;

/// Best samples kept in the report
pub const TOP_SAMPLES: usize = 10;

/// One random weighting and what it does to the ranking
#[derive(Debug, Clone, Serialize)]
pub struct WeightSample {
    pub weights: RatioWeights,
    /// Recomputed score of the default-weighting favorite under these
    /// weights; high values across samples mean the favorite is no fluke
    pub stability: f64,
    /// Rule that tops the ranking under these weights
    pub top_rule: String,
}

/// Trade-count-weighted OOS robustness of one rule under the given weights
fn rule_robustness(result: &MetaResult, weights: &RatioWeights) -> f64 {
    let mut weighted = 0.0;
    let mut trades = 0u64;
    for detail in &result.validation_details {
        let count = detail.kpis.trade_count;
        if count > 0 {
            weighted += robustness_ratio(&detail.kpis, weights) * count as f64;
            trades += count as u64;
        }
    }
    if trades > 0 {
        weighted / trades as f64
    } else {
        0.0
    }
}

/// Five uniform draws normalized to a whole-number split of exactly 100.
/// The largest share absorbs the rounding residue, so no weight can end
/// up below zero.
fn sample_weights(rng: &mut impl Rng) -> RatioWeights {
    let raw: [f64; 5] = [rng.gen(), rng.gen(), rng.gen(), rng.gen(), rng.gen()];
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return RatioWeights::default();
    }
    let mut rounded = raw.map(|v| (v / total * 100.0).round());
    let residual = 100.0 - rounded.iter().sum::<f64>();
    let largest = rounded
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
        .unwrap_or(0);
    rounded[largest] += residual;
    RatioWeights::from_array(rounded)
}

/// Re-rank the walk-forward results under `runs` random weightings.
/// Returns the [`TOP_SAMPLES`] most stable draws, best first.
pub fn run_weights_analysis(
    results: &[MetaResult],
    runs: usize,
    rng: &mut impl Rng,
) -> Vec<WeightSample> {
    if results.is_empty() {
        return Vec::new();
    }

    // The favorite under the default weighting anchors the stability series.
    let default_weights = RatioWeights::default();
    let reference = {
        let scores: Vec<f64> = results
            .iter()
            .map(|r| rule_robustness(r, &default_weights))
            .collect();
        scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap_or(0)
    };

    let mut samples = Vec::with_capacity(runs);
    for _ in 0..runs {
        let weights = sample_weights(rng);
        let mut top_index = 0;
        let mut top_score = f64::NEG_INFINITY;
        let mut reference_score = 0.0;
        for (index, result) in results.iter().enumerate() {
            let score = rule_robustness(result, &weights);
            if index == reference {
                reference_score = score;
            }
            if score > top_score {
                top_score = score;
                top_index = index;
            }
        }
        samples.push(WeightSample {
            weights,
            stability: reference_score,
            top_rule: results[top_index].rule.name.clone(),
        });
    }

    samples.sort_by(|a, b| b.stability.total_cmp(&a.stability));
    samples.truncate(TOP_SAMPLES);
    samples
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MetaRule, ValidationDetail};
    use crate::types::{FilterSettings, KpiSet, StrategySettings};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn detail(annual: f64, win_rate: f64, drawdown: f64, trades: u32) -> ValidationDetail {
        ValidationDetail {
            base_settings: StrategySettings::default(),
            kpis: KpiSet {
                final_value: 11_000.0,
                annual_return: annual,
                trade_count: trades,
                win_rate,
                avg_trade_return: 0.5,
                avg_daily_trade_return: 0.25,
                max_drawdown: drawdown,
                longest_drawdown_duration: 30.0,
                robustness_ratio: 0.0,
            },
        }
    }

    fn rule_result(name: &str, details: Vec<ValidationDetail>) -> MetaResult {
        MetaResult {
            rule: MetaRule {
                name: name.to_string(),
                filter: FilterSettings::default(),
            },
            avg_daily_return_is: 0.0,
            avg_daily_return_oos: 0.0,
            total_profit: 0.0,
            total_trades: details.iter().map(|d| d.kpis.trade_count).sum(),
            validation_details: details,
        }
    }

    #[test]
    fn test_sampled_weights_sum_to_hundred() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..200 {
            let weights = sample_weights(&mut rng);
            let total: f64 = weights.as_array().iter().sum();
            assert_eq!(total, 100.0, "weights must sum to exactly 100");
            for w in weights.as_array() {
                assert_eq!(w, w.round(), "weights are whole numbers");
                assert!(w >= 0.0, "weights must not go negative");
            }
        }
    }

    #[test]
    fn test_empty_results_yield_no_samples() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(run_weights_analysis(&[], 50, &mut rng).is_empty());
    }

    #[test]
    fn test_dominant_rule_stays_on_top() {
        // "good" beats "bad" on every sub-score, so it must win under
        // every weighting.
        let good = rule_result("good", vec![detail(80.0, 90.0, 0.05, 20)]);
        let mut bad_detail = detail(5.0, 30.0, 0.6, 20);
        bad_detail.kpis.avg_daily_trade_return = 0.05;
        bad_detail.kpis.longest_drawdown_duration = 900.0;
        let bad = rule_result("bad", vec![bad_detail]);
        let results = vec![bad, good];

        let mut rng = StdRng::seed_from_u64(42);
        let samples = run_weights_analysis(&results, 40, &mut rng);
        assert_eq!(samples.len(), TOP_SAMPLES);
        for sample in &samples {
            assert_eq!(sample.top_rule, "good");
            assert!(sample.stability > 0.0);
        }
    }

    #[test]
    fn test_samples_sorted_by_stability() {
        let results = vec![rule_result("only", vec![detail(40.0, 60.0, 0.2, 10)])];
        let mut rng = StdRng::seed_from_u64(77);
        let samples = run_weights_analysis(&results, 25, &mut rng);
        for pair in samples.windows(2) {
            assert!(pair[0].stability >= pair[1].stability);
        }
    }

    #[test]
    fn test_zero_trade_rules_score_zero() {
        let silent = rule_result("silent", vec![detail(50.0, 80.0, 0.1, 0)]);
        assert_eq!(rule_robustness(&silent, &RatioWeights::default()), 0.0);
    }

    #[test]
    fn test_seeded_analysis_reproduces() {
        let results = vec![
            rule_result("a", vec![detail(30.0, 55.0, 0.15, 12)]),
            rule_result("b", vec![detail(45.0, 48.0, 0.25, 8)]),
        ];
        let mut rng_one = StdRng::seed_from_u64(5);
        let mut rng_two = StdRng::seed_from_u64(5);
        let one = run_weights_analysis(&results, 30, &mut rng_one);
        let two = run_weights_analysis(&results, 30, &mut rng_two);
        assert_eq!(one.len(), two.len());
        for (x, y) in one.iter().zip(&two) {
            assert_eq!(x.weights, y.weights);
            assert_eq!(x.stability, y.stability);
            assert_eq!(x.top_rule, y.top_rule);
        }
    }
}
