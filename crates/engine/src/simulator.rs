//! Single-position pattern-matching backtest
//!
//! Walks the ranked series day by day. On each eligible day the rank
//! pattern of the most recent days is compared against every historical
//! window that is old enough to be fully resolved; matched forward returns
//! vote on an all-in entry at the open. Positions exit at the close once
//! the holding period has elapsed in calendar days.

use crate::features::FeatureSeries;
use crate::kpi;
use crate::types::{
    EquityPoint, SimulationResult, StrategyMode, StrategySettings, TradeAction, TradeLogEntry,
    START_CAPITAL,
};

/// A fired entry signal, kept even when the filter or the cash check
/// blocked the actual trade
struct SignalEntry {
    day_index: usize,
    holding_period: usize,
}

/// Run one deterministic simulation. Returns `None` when the series does
/// not extend past the lookback window.
pub fn simulate(settings: &StrategySettings, series: &FeatureSeries) -> Option<SimulationResult> {
    let rows = &series.rows;
    if rows.len() <= settings.lookback {
        return None;
    }

    // factor weights normalized once; a zero total falls back to equal weights
    let total_weight: f64 = settings.factors.iter().map(|f| f.weight).sum();
    let factor_weights: Vec<(crate::types::FactorKey, f64)> = settings
        .factors
        .iter()
        .map(|f| {
            let w = if total_weight > 0.0 {
                f.weight / total_weight
            } else {
                1.0 / settings.factors.len() as f64
            };
            (f.key, w)
        })
        .collect();
    let distance_threshold = settings.tolerance / settings.factors.len().max(1) as f64;

    let mut cash = START_CAPITAL;
    let mut shares = 0.0f64;
    let mut trade_log: Vec<TradeLogEntry> = Vec::new();
    let mut signal_log: Vec<SignalEntry> = Vec::new();

    let mut equity_curve = vec![EquityPoint {
        date: rows[0].date,
        value: START_CAPITAL,
    }];
    let mut peak_value = START_CAPITAL;
    let mut peak_date = rows[settings.lookback].date;
    let mut max_drawdown = 0.0f64;
    let mut longest_drawdown_duration = 0.0f64;

    for i in settings.lookback..rows.len() {
        let today = &rows[i];

        // exit once the holding period has elapsed in calendar days
        if shares > 0.0 {
            if let Some(last) = trade_log.last() {
                if last.action == TradeAction::Buy
                    && (today.date - last.date).num_days() >= settings.holding_period as i64
                {
                    cash = shares * today.close;
                    shares = 0.0;
                    trade_log.push(TradeLogEntry {
                        date: today.date,
                        action: TradeAction::Sell,
                        price: today.close,
                    });
                }
            }
        }

        // entry: flat, room for the holding period, full pattern available
        if shares == 0.0
            && i + settings.holding_period < rows.len()
            && i >= settings.pattern_length
        {
            let current_start = i - settings.pattern_length;

            let mut match_count = 0usize;
            let mut outcome_sum = 0.0f64;
            if let Some(last_start) = i.checked_sub(settings.lookback + settings.pattern_length) {
                for j in 0..=last_start {
                    let mut distance = 0.0;
                    for k in 0..settings.pattern_length {
                        let hist = &rows[j + k].ranks;
                        let current = &rows[current_start + k].ranks;
                        for (key, weight) in &factor_weights {
                            distance += (hist.get(*key) as f64 - current.get(*key) as f64).abs()
                                * weight;
                        }
                    }
                    if distance / settings.pattern_length as f64 <= distance_threshold {
                        match_count += 1;
                        outcome_sum += rows[j + settings.pattern_length - 1]
                            .future_return(settings.holding_period);
                    }
                }
            }
            let avg_outcome = if match_count > 0 {
                outcome_sum / match_count as f64
            } else {
                0.0
            };

            if match_count >= settings.min_occurrences && match_count <= settings.max_occurrences {
                let is_buy_signal = match settings.mode {
                    StrategyMode::Trend => avg_outcome > 0.0,
                    StrategyMode::Reversion => avg_outcome < 0.0,
                };
                if is_buy_signal {
                    signal_log.push(SignalEntry {
                        day_index: i,
                        holding_period: settings.holding_period,
                    });

                    let mut execute = true;
                    if settings.filter.enabled
                        && signal_log.len() > settings.filter.trade_lookback
                    {
                        // the trade_lookback signals before the one just fired
                        let recent = &signal_log
                            [signal_log.len() - settings.filter.trade_lookback - 1
                                ..signal_log.len() - 1];
                        let mut perf_sum = 0.0;
                        let mut resolved = 0usize;
                        for sig in recent {
                            if i >= sig.day_index + sig.holding_period {
                                perf_sum += rows[sig.day_index].future_return(sig.holding_period)
                                    / sig.holding_period as f64;
                                resolved += 1;
                            }
                        }
                        // no resolved prior signal counts as insufficient evidence
                        execute = resolved > 0
                            && perf_sum / resolved as f64 >= settings.filter.min_performance;
                    }

                    if execute && cash > today.open {
                        shares = cash / today.open;
                        cash = 0.0;
                        trade_log.push(TradeLogEntry {
                            date: today.date,
                            action: TradeAction::Buy,
                            price: today.open,
                        });
                    }
                }
            }
        }

        // mark to market and track drawdown
        let value = cash + shares * today.close;
        equity_curve.push(EquityPoint {
            date: today.date,
            value,
        });
        if value > peak_value {
            peak_value = value;
            peak_date = today.date;
        } else {
            let duration = (today.date - peak_date).num_days() as f64;
            if duration > longest_drawdown_duration {
                longest_drawdown_duration = duration;
            }
        }
        let drawdown = (peak_value - value) / peak_value;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }

    let last = &rows[rows.len() - 1];
    let final_value = cash + shares * last.close;
    let (kpis, completed_trades) = kpi::compute_kpis(
        &trade_log,
        final_value,
        max_drawdown,
        longest_drawdown_duration,
        rows[settings.lookback].date,
        last.date,
        settings.holding_period,
        &settings.ratio_weights,
    );

    Some(SimulationResult {
        settings: settings.clone(),
        kpis,
        equity_curve,
        completed_trades,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::prepare_features;
    use crate::types::{Candle, Factor, FactorKey, FilterSettings};
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
                    high: open.max(close) * 1.001,
                    low: open.min(close) * 0.999,
                    close,
                    volume: 1_000.0 + (i % 37) as f64 * 25.0,
                }
            })
            .collect()
    }

    /// 300 derived days with a 10-day cycle: two +5% days, a +2% day,
    /// then seven small drifting noise days
    fn pattern_series() -> FeatureSeries {
        let noise = [-0.35, 0.22, -0.28, 0.17, -0.22, 0.12, -0.08];
        let mut closes = vec![100.0];
        for d in 0..300usize {
            let pct = match d % 10 {
                0 | 1 => 5.0,
                2 => 2.0,
                slot => noise[slot - 3] + 0.0005 * d as f64,
            };
            let prev = *closes.last().unwrap();
            closes.push(prev * (1.0 + pct / 100.0));
        }
        prepare_features(&make_candles(&closes)).unwrap()
    }

    fn pattern_settings() -> StrategySettings {
        StrategySettings {
            pattern_length: 2,
            holding_period: 1,
            lookback: 50,
            tolerance: 1.0,
            min_occurrences: 3,
            max_occurrences: 10_000,
            factors: vec![Factor {
                key: FactorKey::Change,
                weight: 100.0,
            }],
            mode: StrategyMode::Trend,
            filter: FilterSettings::default(),
            ratio_weights: Default::default(),
        }
    }

    #[test]
    fn test_insufficient_history_returns_none() {
        let series = prepare_features(&make_candles(&[100.0, 101.0, 102.0, 103.0])).unwrap();
        let settings = StrategySettings {
            lookback: 10,
            ..pattern_settings()
        };
        assert!(simulate(&settings, &series).is_none());
    }

    #[test]
    fn test_engineered_pattern_is_traded_profitably() {
        let series = pattern_series();
        let result = simulate(&pattern_settings(), &series).expect("enough history");

        assert!(
            result.kpis.trade_count >= 1,
            "expected at least one completed trade, got {}",
            result.kpis.trade_count
        );
        assert!(
            result.kpis.avg_trade_return > 0.0,
            "expected positive average trade return, got {}",
            result.kpis.avg_trade_return
        );
        assert!(
            result.kpis.annual_return > 0.0,
            "expected positive annual return, got {}",
            result.kpis.annual_return
        );
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let series = pattern_series();
        let settings = pattern_settings();
        let a = simulate(&settings, &series).expect("run a");
        let b = simulate(&settings, &series).expect("run b");
        assert_eq!(a.kpis, b.kpis);
        assert_eq!(a.completed_trades.len(), b.completed_trades.len());
        assert_eq!(a.equity_curve.len(), b.equity_curve.len());
        assert_eq!(
            a.equity_curve.last().map(|p| p.value),
            b.equity_curve.last().map(|p| p.value)
        );
    }

    #[test]
    fn test_equity_curve_starts_at_series_begin() {
        let series = pattern_series();
        let result = simulate(&pattern_settings(), &series).expect("result");
        assert_eq!(result.equity_curve[0].date, series.rows[0].date);
        assert_eq!(result.equity_curve[0].value, START_CAPITAL);
        // seed point plus one point per simulated day
        assert_eq!(
            result.equity_curve.len(),
            series.rows.len() - pattern_settings().lookback + 1
        );
    }

    #[test]
    fn test_exit_respects_holding_period_days() {
        let series = pattern_series();
        let settings = StrategySettings {
            holding_period: 3,
            ..pattern_settings()
        };
        let result = simulate(&settings, &series).expect("result");
        for trade in &result.completed_trades {
            assert!(
                (trade.sell_date - trade.buy_date).num_days() >= 3,
                "trade held {} days, expected >= 3",
                (trade.sell_date - trade.buy_date).num_days()
            );
        }
    }

    #[test]
    fn test_filter_without_resolved_evidence_suppresses_all() {
        let series = pattern_series();
        let mut settings = pattern_settings();
        // lookback 0 means the inspected slice is always empty, so no
        // signal ever has resolved evidence behind it
        settings.filter = FilterSettings {
            enabled: true,
            trade_lookback: 0,
            min_performance: 0.0,
        };
        let result = simulate(&settings, &series).expect("result");

        assert_eq!(result.kpis.trade_count, 0);
        assert!(result.completed_trades.is_empty());
        assert_eq!(result.kpis.final_value, START_CAPITAL);
        assert_eq!(result.kpis.annual_return, 0.0);
        assert_eq!(result.kpis.win_rate, 0.0);
        assert_eq!(result.kpis.max_drawdown, 0.0);
    }

    #[test]
    fn test_lenient_filter_still_trades() {
        let series = pattern_series();
        let mut settings = pattern_settings();
        settings.filter = FilterSettings {
            enabled: true,
            trade_lookback: 5,
            min_performance: -10.0,
        };
        let filtered = simulate(&settings, &series).expect("filtered");
        assert!(
            filtered.kpis.trade_count >= 1,
            "a filter nothing can fail should not block trading"
        );
    }

    #[test]
    fn test_strict_filter_reduces_trades() {
        let series = pattern_series();
        let mut lenient = pattern_settings();
        lenient.filter = FilterSettings {
            enabled: true,
            trade_lookback: 5,
            min_performance: -10.0,
        };
        let mut strict = lenient.clone();
        strict.filter.min_performance = 100.0;

        let lenient_result = simulate(&lenient, &series).expect("lenient");
        let strict_result = simulate(&strict, &series).expect("strict");
        assert!(
            strict_result.kpis.trade_count < lenient_result.kpis.trade_count,
            "strict filter should trade less: {} vs {}",
            strict_result.kpis.trade_count,
            lenient_result.kpis.trade_count
        );
    }

    #[test]
    fn test_flat_equity_has_no_drawdown() {
        // steadily rising series, strategy that never signals
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let series = prepare_features(&make_candles(&closes)).unwrap();
        let settings = StrategySettings {
            lookback: 20,
            min_occurrences: 100_000,
            ..pattern_settings()
        };
        let result = simulate(&settings, &series).expect("result");
        assert_eq!(result.kpis.trade_count, 0);
        assert_eq!(result.kpis.max_drawdown, 0.0);
    }
}
