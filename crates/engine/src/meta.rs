//! Walk-forward validation.
//!
//! Phase 1 discovers base strategies on the training segment only. Phase 2
//! spans a grid of signal-performance filter rules over those bases and
//! scores every combination out of sample, so a rule can never be picked
//! with knowledge of the data it is judged on. A rank analysis and a
//! cross-dataset robustness check read the phase 2 output.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::features::{benchmark_daily_return, derive_metrics, BinSet, FeatureSeries};
use crate::optimizer::{OptimizerOptions, SearchOptimizer};
use crate::sampler::ParameterRange;
use crate::simulator::simulate;
use crate::types::{
    Candle, FilterSettings, KpiSet, MetricRow, SimulationResult, StrategySettings, START_CAPITAL,
};

// ============================================================================
// Constants
// ============================================================================

pub const MAX_RULE_COMBINATIONS: usize = 1000;

/// Filter rules validated between progress events
const VALIDATION_BATCH: usize = 5;

// ============================================================================
// Split
// ============================================================================

/// Chronological split at `floor(len * fraction)`. The fraction is the
/// training share and must stay in 0.1..=0.9.
pub fn split_rows(
    rows: &[MetricRow],
    fraction: f64,
) -> Result<(Vec<MetricRow>, Vec<MetricRow>), EngineError> {
    if !(0.1..=0.9).contains(&fraction) {
        return Err(EngineError::InvalidSplit(fraction));
    }
    let split = (rows.len() as f64 * fraction).floor() as usize;
    Ok((rows[..split].to_vec(), rows[split..].to_vec()))
}

// ============================================================================
// Filter-rule grid
// ============================================================================

/// Axes of the filter-rule lattice phase 2 walks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterGrid {
    pub trade_lookback: ParameterRange,
    pub min_performance: ParameterRange,
}

/// One competitor in phase 2: a named filter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRule {
    pub name: String,
    pub filter: FilterSettings,
}

impl FilterGrid {
    /// The filter-off baseline followed by every lattice combination.
    /// The grid alone is capped at [`MAX_RULE_COMBINATIONS`]; an empty
    /// grid is rejected too.
    pub fn rules(&self) -> Result<Vec<MetaRule>, EngineError> {
        let lookbacks = self.trade_lookback.values();
        let performances = self.min_performance.values();
        let count = lookbacks.len() * performances.len();
        if count == 0 || count > MAX_RULE_COMBINATIONS {
            return Err(EngineError::CombinationLimitExceeded {
                count,
                max: MAX_RULE_COMBINATIONS,
            });
        }

        let mut rules = Vec::with_capacity(count + 1);
        rules.push(MetaRule {
            name: "Filter Off".to_string(),
            filter: FilterSettings::default(),
        });
        for &trade_lookback in &lookbacks {
            for &min_performance in &performances {
                rules.push(MetaRule {
                    name: format!("Filter {}T / {:.1}%", trade_lookback as usize, min_performance),
                    filter: FilterSettings {
                        enabled: true,
                        trade_lookback: trade_lookback as usize,
                        min_performance,
                    },
                });
            }
        }
        Ok(rules)
    }
}

// ============================================================================
// Report types
// ============================================================================

#[derive(Debug, Clone)]
pub struct MetaRequest {
    /// Training share of the dataset
    pub split_fraction: f64,
    pub grid: FilterGrid,
    pub phase1: OptimizerOptions,
    pub phase1_budget: Duration,
}

#[derive(Debug, Clone)]
pub enum MetaEvent {
    Phase1Started { training_len: usize, validation_len: usize },
    Phase2Progress { done: usize, total: usize },
    Finished { rules: usize },
}

/// OOS outcome of one base strategy under one rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDetail {
    pub base_settings: StrategySettings,
    pub kpis: KpiSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaResult {
    pub rule: MetaRule,
    /// Trade-count-weighted mean daily trade return on the training segment
    pub avg_daily_return_is: f64,
    /// Same measure out of sample, the ranking key
    pub avg_daily_return_oos: f64,
    /// Sum of OOS final values minus start capital across bases
    pub total_profit: f64,
    pub total_trades: u32,
    pub validation_details: Vec<ValidationDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaReport {
    /// Ranked best-OOS-first
    pub results: Vec<MetaResult>,
    pub benchmark_is: f64,
    pub benchmark_oos: f64,
    pub training_len: usize,
    pub validation_len: usize,
    pub base_strategies: usize,
}

// ============================================================================
// Walk-forward run
// ============================================================================

fn emit(events: &Option<mpsc::UnboundedSender<MetaEvent>>, event: MetaEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Score one rule across all base strategies on both segments
fn validate_rule(
    rule: &MetaRule,
    bases: &[Arc<SimulationResult>],
    training: &FeatureSeries,
    validation: &FeatureSeries,
) -> MetaResult {
    let mut weighted_is = 0.0;
    let mut trades_is = 0u64;
    let mut weighted_oos = 0.0;
    let mut trades_oos = 0u64;
    let mut total_profit = 0.0;
    let mut details = Vec::with_capacity(bases.len());

    for base in bases {
        let mut merged = base.settings.clone();
        merged.filter = rule.filter;

        if let Some(result) = simulate(&merged, training) {
            let kpis = result.kpis;
            if kpis.trade_count > 0 {
                weighted_is += kpis.avg_daily_trade_return * kpis.trade_count as f64;
                trades_is += kpis.trade_count as u64;
            }
        }
        if let Some(result) = simulate(&merged, validation) {
            let kpis = result.kpis;
            total_profit += kpis.final_value - START_CAPITAL;
            if kpis.trade_count > 0 {
                weighted_oos += kpis.avg_daily_trade_return * kpis.trade_count as f64;
                trades_oos += kpis.trade_count as u64;
            }
            details.push(ValidationDetail {
                base_settings: base.settings.clone(),
                kpis,
            });
        }
    }

    MetaResult {
        rule: rule.clone(),
        avg_daily_return_is: if trades_is > 0 {
            weighted_is / trades_is as f64
        } else {
            0.0
        },
        avg_daily_return_oos: if trades_oos > 0 {
            weighted_oos / trades_oos as f64
        } else {
            0.0
        },
        total_profit,
        total_trades: trades_oos as u32,
        validation_details: details,
    }
}

/// Run the two-phase walk-forward protocol over `rows`.
pub async fn run_meta_optimization(
    request: MetaRequest,
    rows: &[MetricRow],
    events: Option<mpsc::UnboundedSender<MetaEvent>>,
) -> Result<MetaReport, EngineError> {
    let rules = request.grid.rules()?;
    let (training, validation) = split_rows(rows, request.split_fraction)?;

    let benchmark_is = benchmark_daily_return(&training);
    let benchmark_oos = benchmark_daily_return(&validation);

    // Validation days are ranked against the training distribution, the
    // simulator never sees validation-fitted bins.
    let training_series = Arc::new(FeatureSeries::fit(&training));
    let validation_series = FeatureSeries::with_bins(&validation, &training_series.bins);

    emit(
        &events,
        MetaEvent::Phase1Started {
            training_len: training.len(),
            validation_len: validation.len(),
        },
    );
    info!(
        training = training.len(),
        validation = validation.len(),
        rules = rules.len() - 1,
        "walk-forward run started"
    );

    let (phase1_events, mut phase1_rx) = mpsc::unbounded_channel();
    let optimizer = SearchOptimizer::spawn(phase1_events);
    optimizer.start(Arc::clone(&training_series), request.phase1.clone());

    let budget = tokio::time::sleep(request.phase1_budget);
    tokio::pin!(budget);
    loop {
        tokio::select! {
            _ = &mut budget => break,
            event = phase1_rx.recv() => {
                if event.is_none() {
                    break;
                }
            }
        }
    }

    let bases = optimizer.snapshot().await;
    optimizer.stop();

    if bases.is_empty() {
        warn!("phase 1 found no tradeable base strategies");
        emit(&events, MetaEvent::Finished { rules: 0 });
        return Ok(MetaReport {
            results: Vec::new(),
            benchmark_is,
            benchmark_oos,
            training_len: training.len(),
            validation_len: validation.len(),
            base_strategies: 0,
        });
    }
    info!(bases = bases.len(), "phase 1 complete, validating filter rules");

    let total = rules.len();
    let mut results = Vec::with_capacity(total);
    for (index, rule) in rules.iter().enumerate() {
        results.push(validate_rule(rule, &bases, &training_series, &validation_series));
        let done = index + 1;
        if done % VALIDATION_BATCH == 0 || done == total {
            emit(&events, MetaEvent::Phase2Progress { done, total });
            tokio::task::yield_now().await;
        }
    }

    results.sort_by(|a, b| b.avg_daily_return_oos.total_cmp(&a.avg_daily_return_oos));
    emit(&events, MetaEvent::Finished { rules: results.len() });
    info!(rules = results.len(), "walk-forward run finished");

    Ok(MetaReport {
        results,
        benchmark_is,
        benchmark_oos,
        training_len: training.len(),
        validation_len: validation.len(),
        base_strategies: bases.len(),
    })
}

// ============================================================================
// Rank analysis
// ============================================================================

/// Mean OOS rank of every axis value across grid rules
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RankBucket {
    pub value: f64,
    pub mean_rank: f64,
    pub rules: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankAnalysis {
    pub by_trade_lookback: Vec<RankBucket>,
    pub by_min_performance: Vec<RankBucket>,
}

/// Group ranked results (1-based positions in OOS order, baseline keeps its
/// slot but joins no bucket) by each filter axis.
pub fn rank_analysis(results: &[MetaResult]) -> RankAnalysis {
    use std::collections::BTreeMap;

    let mut by_lookback: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    let mut by_performance: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (index, result) in results.iter().enumerate() {
        if !result.rule.filter.enabled {
            continue;
        }
        let rank = (index + 1) as f64;
        by_lookback
            .entry(result.rule.filter.trade_lookback)
            .or_default()
            .push(rank);
        by_performance
            .entry((result.rule.filter.min_performance * 10.0).round() as i64)
            .or_default()
            .push(rank);
    }

    fn mean(values: &[f64]) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    let mut by_trade_lookback: Vec<RankBucket> = by_lookback
        .into_iter()
        .map(|(value, ranks)| RankBucket {
            value: value as f64,
            mean_rank: mean(&ranks),
            rules: ranks.len(),
        })
        .collect();
    by_trade_lookback.sort_by(|a, b| a.mean_rank.total_cmp(&b.mean_rank));

    let mut by_min_performance: Vec<RankBucket> = by_performance
        .into_iter()
        .map(|(value, ranks)| RankBucket {
            value: value as f64 / 10.0,
            mean_rank: mean(&ranks),
            rules: ranks.len(),
        })
        .collect();
    by_min_performance.sort_by(|a, b| a.mean_rank.total_cmp(&b.mean_rank));

    RankAnalysis {
        by_trade_lookback,
        by_min_performance,
    }
}

// ============================================================================
// Cross-dataset robustness check
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobustnessRow {
    pub name: String,
    pub avg_trade_return: f64,
    pub trade_count: u32,
}

/// Replay one strategy on unrelated datasets, ranking their days against
/// the training distribution. Datasets too short to simulate produce a
/// zero row rather than an error.
pub fn run_robustness_check(
    settings: &StrategySettings,
    training: &[Candle],
    tests: &[(String, Vec<Candle>)],
) -> Result<Vec<RobustnessRow>, EngineError> {
    let training_rows = derive_metrics(training);
    if training_rows.is_empty() {
        return Err(EngineError::InvalidDataset(
            "training dataset yields no derived days".to_string(),
        ));
    }
    let bins = BinSet::fit(&training_rows);

    let mut report = Vec::with_capacity(tests.len());
    for (name, candles) in tests {
        let rows = derive_metrics(candles);
        let series = FeatureSeries::with_bins(&rows, &bins);
        let row = match simulate(settings, &series) {
            Some(result) => RobustnessRow {
                name: name.clone(),
                avg_trade_return: result.kpis.avg_trade_return,
                trade_count: result.kpis.trade_count,
            },
            None => {
                warn!(dataset = %name, "not enough history for the robustness check");
                RobustnessRow {
                    name: name.clone(),
                    avg_trade_return: 0.0,
                    trade_count: 0,
                }
            }
        };
        report.push(row);
    }
    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================
