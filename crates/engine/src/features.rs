//! Feature pipeline: daily metric derivation, decile binning and rank
//! assignment
//!
//! Candles become `MetricRow`s (one per day, day 0 is consumed by the
//! day-over-day math), then a `BinSet` of decile boundaries turns every
//! metric value into a 0..9 rank. Bins can be fitted on the rows at hand or
//! reused from another segment, which is how walk-forward validation keeps
//! its out-of-sample segment untouched by in-sample statistics.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{Candle, FactorKey, FeatureRow, MetricRow, Metrics, Ranks};

/// Metrics with fewer distinct values than this are not binned at all
const MIN_UNIQUE_VALUES: usize = 10;

/// Rank assigned to every value of a degenerate (unbinned) metric
const DEGENERATE_RANK: u8 = 5;

// ============================================================================
// Derivation
// ============================================================================

/// Derive the six daily metrics from a candle series.
///
/// Day i is measured against day i-1, so the first candle produces no row;
/// row indices restart at 0.
pub fn derive_metrics(candles: &[Candle]) -> Vec<MetricRow> {
    candles
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let prev = &pair[0];
            let day = &pair[1];
            let range = day.high - day.low;
            MetricRow {
                index: i,
                date: day.date,
                open: day.open,
                close: day.close,
                metrics: Metrics {
                    change: (day.close - prev.close) / prev.close * 100.0,
                    close_pos: if range > 0.0 {
                        (day.close - day.low) / range
                    } else {
                        0.5
                    },
                    volume_change: if prev.volume > 0.0 {
                        (day.volume - prev.volume) / prev.volume * 100.0
                    } else {
                        0.0
                    },
                    absolute_volume: day.volume,
                    upper_strength: (day.high - prev.close) / prev.close * 100.0,
                    lower_strength: (day.low - prev.close) / prev.close * 100.0,
                },
            }
        })
        .collect()
}

/// Mean daily percent change over a segment, skipping non-finite values.
///
/// Serves as the buy-and-hold style benchmark the walk-forward report
/// prints next to each segment.
pub fn benchmark_daily_return(rows: &[MetricRow]) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for row in rows {
        if row.metrics.change.is_finite() {
            sum += row.metrics.change;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

// ============================================================================
// Quantile binning
// ============================================================================

/// Linear-interpolation quantile over an ascending slice
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let pos = (sorted.len() - 1) as f64 * p;
    let base = pos.floor() as usize;
    let rest = pos - base as f64;
    match sorted.get(base + 1) {
        Some(next) => sorted[base] + rest * (next - sorted[base]),
        None => sorted[base],
    }
}

/// Decile boundaries per metric. An empty boundary vector marks a
/// degenerate metric whose values all rank [`DEGENERATE_RANK`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinSet {
    bounds: [Vec<f64>; 6],
}

impl BinSet {
    /// Fit decile boundaries on the distinct finite values of each metric
    pub fn fit(rows: &[MetricRow]) -> Self {
        let mut bounds: [Vec<f64>; 6] = Default::default();
        for key in FactorKey::ALL {
            let mut values: Vec<f64> = rows
                .iter()
                .map(|r| r.metrics.get(key))
                .filter(|v| v.is_finite())
                .collect();
            values.sort_by(f64::total_cmp);
            values.dedup();

            bounds[key.index()] = if values.len() < MIN_UNIQUE_VALUES {
                debug!(
                    metric = key.label(),
                    unique = values.len(),
                    "degenerate binning, ranks pinned"
                );
                Vec::new()
            } else {
                (1..=9).map(|i| quantile(&values, i as f64 / 10.0)).collect()
            };
        }
        Self { bounds }
    }

    /// Rank of a value: the number of boundaries it exceeds (0..9), or
    /// [`DEGENERATE_RANK`] when the metric has no boundaries
    pub fn rank(&self, value: f64, key: FactorKey) -> u8 {
        let bounds = &self.bounds[key.index()];
        if bounds.is_empty() {
            return DEGENERATE_RANK;
        }
        bounds.iter().filter(|b| value > **b).count() as u8
    }

    pub fn is_degenerate(&self, key: FactorKey) -> bool {
        self.bounds[key.index()].is_empty()
    }
}

// ============================================================================
// Series assembly
// ============================================================================

/// Percent returns of row i over the next 1..=5 rows; 0.0 past the end
fn forward_returns(rows: &[MetricRow], i: usize) -> [f64; 5] {
    let mut out = [0.0; 5];
    for hp in 1..=5usize {
        if let Some(future) = rows.get(i + hp) {
            out[hp - 1] = (future.close - rows[i].close) / rows[i].close * 100.0;
        }
    }
    out
}

/// A ranked feature series ready for simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSeries {
    pub rows: Vec<FeatureRow>,
    pub bins: BinSet,
}

impl FeatureSeries {
    /// Fit mode: bin boundaries come from these rows
    pub fn fit(rows: &[MetricRow]) -> Self {
        let bins = BinSet::fit(rows);
        Self::build(rows, bins)
    }

    /// Apply mode: rank against previously fitted bins, recomputing nothing
    pub fn with_bins(rows: &[MetricRow], bins: &BinSet) -> Self {
        Self::build(rows, bins.clone())
    }

    fn build(source: &[MetricRow], bins: BinSet) -> Self {
        let rows = source
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut ranks = Ranks::default();
                for key in FactorKey::ALL {
                    ranks.0[key.index()] = bins.rank(row.metrics.get(key), key);
                }
                FeatureRow {
                    index: i,
                    date: row.date,
                    open: row.open,
                    close: row.close,
                    metrics: row.metrics,
                    ranks,
                    future_returns: forward_returns(source, i),
                }
            })
            .collect();
        Self { rows, bins }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Derive, fit and rank a candle series in one step
pub fn prepare_features(candles: &[Candle]) -> Result<FeatureSeries, EngineError> {
    let rows = derive_metrics(candles);
    if rows.is_empty() {
        return Err(EngineError::InvalidDataset(format!(
            "{} candles leave no derivable days",
            candles.len()
        )));
    }
    Ok(FeatureSeries::fit(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(i: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .checked_add_days(chrono::Days::new(i as u64))
            .unwrap()
    }

    fn make_candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Candle {
                    date: day(i),
                    open,
                    high: open.max(close) * 1.01,
                    low: open.min(close) * 0.99,
                    close,
                    volume: 1_000.0 + (i as f64) * 10.0,
                }
            })
            .collect()
    }

    fn metric_row(i: usize, change: f64) -> MetricRow {
        MetricRow {
            index: i,
            date: day(i),
            open: 100.0,
            close: 100.0,
            metrics: Metrics {
                change,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_derivation_drops_first_day() {
        let candles = make_candles(&[100.0, 102.0, 101.0]);
        let rows = derive_metrics(&candles);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 0);
        assert_eq!(rows[0].date, day(1));
        assert!((rows[0].metrics.change - 2.0).abs() < 1e-9);
        assert!((rows[1].metrics.change - (101.0 - 102.0) / 102.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_pos_on_flat_day_is_half() {
        let candles = vec![
            Candle {
                date: day(0),
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 500.0,
            },
            Candle {
                date: day(1),
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 500.0,
            },
        ];
        let rows = derive_metrics(&candles);
        assert_eq!(rows[0].metrics.close_pos, 0.5);
        assert_eq!(rows[0].metrics.volume_change, 0.0);
    }

    #[test]
    fn test_quantile_exact_deciles() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert!((quantile(&values, 0.5) - 50.5).abs() < 1e-9);
        assert!((quantile(&values, 0.1) - 10.9).abs() < 1e-9);
        assert!((quantile(&values, 0.9) - 90.1).abs() < 1e-9);
        assert_eq!(quantile(&values, 1.0), 100.0);
    }

    #[test]
    fn test_degenerate_metric_ranks_five() {
        let rows: Vec<MetricRow> = (0..20).map(|i| metric_row(i, 1.0)).collect();
        let bins = BinSet::fit(&rows);
        assert!(bins.is_degenerate(FactorKey::Change));
        assert_eq!(bins.rank(1.0, FactorKey::Change), 5);
        assert_eq!(bins.rank(-100.0, FactorKey::Change), 5);
    }

    #[test]
    fn test_rank_monotone_in_value() {
        let rows: Vec<MetricRow> = (0..100).map(|i| metric_row(i, (i + 1) as f64)).collect();
        let bins = BinSet::fit(&rows);
        let mut prev = 0u8;
        for v in 0..120 {
            let rank = bins.rank(v as f64, FactorKey::Change);
            assert!(
                rank >= prev,
                "rank must not decrease: rank({}) = {} after {}",
                v,
                rank,
                prev
            );
            prev = rank;
        }
        assert_eq!(bins.rank(0.0, FactorKey::Change), 0);
        assert_eq!(bins.rank(200.0, FactorKey::Change), 9);
    }

    #[test]
    fn test_forward_returns_past_end_are_zero() {
        let rows: Vec<MetricRow> = (0..8)
            .map(|i| MetricRow {
                index: i,
                date: day(i),
                open: 100.0,
                close: 100.0 + i as f64,
                metrics: Metrics::default(),
            })
            .collect();
        let series = FeatureSeries::fit(&rows);
        let last = &series.rows[7];
        assert_eq!(last.future_returns, [0.0; 5]);
        // one step before the end only hp=1 resolves
        let second_last = &series.rows[6];
        assert!(second_last.future_returns[0] > 0.0);
        assert_eq!(second_last.future_returns[1], 0.0);
        assert_eq!(second_last.future_return(1), second_last.future_returns[0]);
    }

    #[test]
    fn test_apply_mode_reuses_training_bins() {
        let training: Vec<MetricRow> = (0..100).map(|i| metric_row(i, (i + 1) as f64)).collect();
        let fitted = BinSet::fit(&training);

        // constant validation segment: self-fitting would be degenerate
        let validation: Vec<MetricRow> = (0..30).map(|i| metric_row(i, 1_000.0)).collect();
        let applied = FeatureSeries::with_bins(&validation, &fitted);
        assert!(applied.rows.iter().all(|r| r.ranks.get(FactorKey::Change) == 9));

        let self_fit = FeatureSeries::fit(&validation);
        assert!(self_fit.rows.iter().all(|r| r.ranks.get(FactorKey::Change) == 5));
    }

    #[test]
    fn test_prepare_features_rejects_tiny_input() {
        let candles = make_candles(&[100.0]);
        assert!(matches!(
            prepare_features(&candles),
            Err(EngineError::InvalidDataset(_))
        ));
        assert!(matches!(
            prepare_features(&[]),
            Err(EngineError::InvalidDataset(_))
        ));
    }

    #[test]
    fn test_benchmark_mean_change() {
        let rows = vec![
            metric_row(0, 1.0),
            metric_row(1, 3.0),
            metric_row(2, f64::INFINITY),
        ];
        assert!((benchmark_daily_return(&rows) - 2.0).abs() < 1e-9);
        assert_eq!(benchmark_daily_return(&[]), 0.0);
    }
}
