//! KPI assembly: trade pairing, annualized return, robustness score

use chrono::NaiveDate;

use crate::types::{
    CompletedTrade, KpiSet, RatioWeights, TradeAction, TradeLogEntry, START_CAPITAL,
};

/// Target average daily trade return that scores 1.0 in the robustness mix
const DAILY_RETURN_TARGET: f64 = 0.5;

/// Drawdown duration (in years) that zeroes its robustness sub-score
const DRAWDOWN_YEARS_CAP: f64 = 5.0;

/// Pair the chronological fill log into completed buy/sell round trips.
///
/// An unmatched trailing buy (position still open at the end) is left out.
pub fn pair_trades(trade_log: &[TradeLogEntry]) -> Vec<CompletedTrade> {
    let mut completed = Vec::new();
    let mut i = 0;
    while i + 1 < trade_log.len() {
        let buy = &trade_log[i];
        let sell = &trade_log[i + 1];
        if buy.action == TradeAction::Buy && sell.action == TradeAction::Sell && buy.price > 0.0 {
            completed.push(CompletedTrade {
                buy_date: buy.date,
                buy_price: buy.price,
                sell_date: sell.date,
                sell_price: sell.price,
                return_pct: (sell.price - buy.price) / buy.price,
            });
        }
        i += 2;
    }
    completed
}

/// CAGR in percent against the fixed starting capital; 0.0 for an empty
/// or inverted date window
pub fn annualized_return(final_value: f64, start: NaiveDate, end: NaiveDate) -> f64 {
    let years = (end - start).num_days() as f64 / 365.25;
    if years <= 0.0 {
        return 0.0;
    }
    ((final_value / START_CAPITAL).powf(1.0 / years) - 1.0) * 100.0
}

/// Weighted composite of five normalized sub-scores, scaled to ~0..100.
///
/// Return-based sub-scores are floored at 0 but not capped, so outsized
/// returns can push the ratio above 100.
pub fn robustness_ratio(kpis: &KpiSet, weights: &RatioWeights) -> f64 {
    let total = weights.total();
    if total <= 0.0 {
        return 0.0;
    }
    let scores = [
        (kpis.annual_return / 100.0).max(0.0),
        (kpis.avg_daily_trade_return / DAILY_RETURN_TARGET).max(0.0),
        kpis.win_rate / 100.0,
        1.0 - kpis.max_drawdown,
        1.0 - ((kpis.longest_drawdown_duration / 365.25) / DRAWDOWN_YEARS_CAP).min(1.0),
    ];
    let weighted: f64 = scores
        .iter()
        .zip(weights.as_array().iter())
        .map(|(score, weight)| score * weight)
        .sum();
    weighted / total * 100.0
}

/// Build the full KPI set from a finished simulation's raw tallies
#[allow(clippy::too_many_arguments)]
pub fn compute_kpis(
    trade_log: &[TradeLogEntry],
    final_value: f64,
    max_drawdown: f64,
    longest_drawdown_duration: f64,
    start: NaiveDate,
    end: NaiveDate,
    holding_period: usize,
    weights: &RatioWeights,
) -> (KpiSet, Vec<CompletedTrade>) {
    let completed = pair_trades(trade_log);
    let trade_count = completed.len() as u32;
    let winners = completed.iter().filter(|t| t.return_pct > 0.0).count();
    let total_return: f64 = completed.iter().map(|t| t.return_pct).sum();

    let win_rate = if trade_count > 0 {
        winners as f64 / trade_count as f64 * 100.0
    } else {
        0.0
    };
    let avg_trade_return = if trade_count > 0 {
        total_return / trade_count as f64 * 100.0
    } else {
        0.0
    };
    let avg_daily_trade_return = if trade_count > 0 {
        avg_trade_return / holding_period as f64
    } else {
        0.0
    };

    let mut kpis = KpiSet {
        final_value,
        annual_return: annualized_return(final_value, start, end),
        trade_count,
        win_rate,
        avg_trade_return,
        avg_daily_trade_return,
        max_drawdown,
        longest_drawdown_duration,
        robustness_ratio: 0.0,
    };
    kpis.robustness_ratio = robustness_ratio(&kpis, weights);
    (kpis, completed)
}
