//! Bounded best-N collection of simulation results with a switchable
//! sort key. Admission is strict: a full board only takes a candidate
//! that beats the current worst entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{KpiSet, SimulationResult, StrategySettings};

// ---------------------------------------------------------------------------
// Sort keys
// ---------------------------------------------------------------------------

/// KPI column the leaderboard ranks by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    RobustnessRatio,
    AnnualReturn,
    AvgDailyTradeReturn,
    TradeCount,
    WinRate,
}

impl SortColumn {
    pub const ALL: [SortColumn; 5] = [
        SortColumn::RobustnessRatio,
        SortColumn::AnnualReturn,
        SortColumn::AvgDailyTradeReturn,
        SortColumn::TradeCount,
        SortColumn::WinRate,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::RobustnessRatio => "Robustness",
            Self::AnnualReturn => "Annual Return %",
            Self::AvgDailyTradeReturn => "Avg Daily Return %",
            Self::TradeCount => "Trades",
            Self::WinRate => "Win Rate %",
        }
    }

    pub fn value(&self, kpis: &KpiSet) -> f64 {
        match self {
            Self::RobustnessRatio => kpis.robustness_ratio,
            Self::AnnualReturn => kpis.annual_return,
            Self::AvgDailyTradeReturn => kpis.avg_daily_trade_return,
            Self::TradeCount => kpis.trade_count as f64,
            Self::WinRate => kpis.win_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Desc,
    Asc,
}

impl SortDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Desc => "descending",
            Self::Asc => "ascending",
        }
    }
}

// ---------------------------------------------------------------------------
// Leaderboard
// ---------------------------------------------------------------------------

/// Slim view of a leaderboard slot, what event consumers get
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub settings: StrategySettings,
    pub kpis: KpiSet,
}

#[derive(Debug)]
pub struct Leaderboard {
    capacity: usize,
    column: SortColumn,
    direction: SortDirection,
    results: Vec<Arc<SimulationResult>>,
}

impl Leaderboard {
    pub fn new(capacity: usize, column: SortColumn, direction: SortDirection) -> Self {
        Self {
            capacity: capacity.max(1),
            column,
            direction,
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn sort_column(&self) -> SortColumn {
        self.column
    }

    pub fn sort_direction(&self) -> SortDirection {
        self.direction
    }

    /// Full results, best first
    pub fn results(&self) -> &[Arc<SimulationResult>] {
        &self.results
    }

    /// Settings plus KPIs per slot, best first
    pub fn entries(&self) -> Vec<LeaderboardEntry> {
        self.results
            .iter()
            .map(|r| LeaderboardEntry {
                settings: r.settings.clone(),
                kpis: r.kpis,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Offer a result. A board below capacity takes everything; a full
    /// board only takes strict improvements over its worst entry, which
    /// then gets evicted.
    pub fn admit(&mut self, result: SimulationResult) -> bool {
        let value = self.column.value(&result.kpis);
        if self.results.len() >= self.capacity {
            // Sorted best-first, so the worst entry sits at the end.
            let worst = match self.results.last() {
                Some(r) => self.column.value(&r.kpis),
                None => return false,
            };
            if !self.beats(value, worst) {
                return false;
            }
        }
        self.results.push(Arc::new(result));
        self.resort();
        self.results.truncate(self.capacity);
        true
    }

    /// Change the ranking mid-session. Existing entries stay and get
    /// re-ordered; future admissions compete under the new key.
    pub fn set_sort(&mut self, column: SortColumn, direction: SortDirection) {
        self.column = column;
        self.direction = direction;
        self.resort();
    }

    fn beats(&self, candidate: f64, worst: f64) -> bool {
        match self.direction {
            SortDirection::Desc => candidate > worst,
            SortDirection::Asc => candidate < worst,
        }
    }

    fn resort(&mut self) {
        let column = self.column;
        match self.direction {
            SortDirection::Desc => self
                .results
                .sort_by(|a, b| column.value(&b.kpis).total_cmp(&column.value(&a.kpis))),
            SortDirection::Asc => self
                .results
                .sort_by(|a, b| column.value(&a.kpis).total_cmp(&column.value(&b.kpis))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategySettings;

    fn make_result(robustness: f64, annual: f64, trades: u32) -> SimulationResult {
        let kpis = KpiSet {
            final_value: 10_000.0,
            annual_return: annual,
            trade_count: trades,
            win_rate: 50.0,
            avg_trade_return: 0.0,
            avg_daily_trade_return: 0.0,
            max_drawdown: 0.0,
            longest_drawdown_duration: 0.0,
            robustness_ratio: robustness,
        };
        SimulationResult {
            settings: StrategySettings::default(),
            kpis,
            equity_curve: Vec::new(),
            completed_trades: Vec::new(),
        }
    }

    #[test]
    fn test_fills_up_to_capacity() {
        let mut board = Leaderboard::new(3, SortColumn::RobustnessRatio, SortDirection::Desc);
        assert!(board.admit(make_result(10.0, 0.0, 1)));
        assert!(board.admit(make_result(5.0, 0.0, 1)));
        assert!(board.admit(make_result(1.0, 0.0, 1)), "below capacity everything is admitted");
        assert_eq!(board.len(), 3);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut board = Leaderboard::new(5, SortColumn::RobustnessRatio, SortDirection::Desc);
        for i in 0..50 {
            board.admit(make_result((i * 7 % 23) as f64, 0.0, 1));
            assert!(board.len() <= 5, "board grew past capacity");
        }
        assert_eq!(board.len(), 5);
    }

    #[test]
    fn test_full_board_rejects_non_improvement() {
        let mut board = Leaderboard::new(2, SortColumn::RobustnessRatio, SortDirection::Desc);
        board.admit(make_result(50.0, 0.0, 1));
        board.admit(make_result(40.0, 0.0, 1));

        assert!(!board.admit(make_result(40.0, 0.0, 1)), "ties must not displace entries");
        assert!(!board.admit(make_result(10.0, 0.0, 1)));
        assert!(board.admit(make_result(45.0, 0.0, 1)));

        let scores: Vec<f64> = board.results().iter().map(|r| r.kpis.robustness_ratio).collect();
        assert_eq!(scores, vec![50.0, 45.0], "worst entry evicted on admission");
    }

    #[test]
    fn test_ascending_direction_prefers_small() {
        let mut board = Leaderboard::new(2, SortColumn::AnnualReturn, SortDirection::Asc);
        board.admit(make_result(0.0, 30.0, 1));
        board.admit(make_result(0.0, 10.0, 1));
        assert!(board.admit(make_result(0.0, 5.0, 1)));
        assert!(!board.admit(make_result(0.0, 20.0, 1)));

        let values: Vec<f64> = board.results().iter().map(|r| r.kpis.annual_return).collect();
        assert_eq!(values, vec![5.0, 10.0]);
    }

    #[test]
    fn test_set_sort_reorders_existing_entries() {
        let mut board = Leaderboard::new(3, SortColumn::RobustnessRatio, SortDirection::Desc);
        board.admit(make_result(80.0, 1.0, 3));
        board.admit(make_result(60.0, 9.0, 7));
        board.admit(make_result(70.0, 5.0, 5));

        board.set_sort(SortColumn::AnnualReturn, SortDirection::Desc);
        let annuals: Vec<f64> = board.results().iter().map(|r| r.kpis.annual_return).collect();
        assert_eq!(annuals, vec![9.0, 5.0, 1.0]);

        board.set_sort(SortColumn::TradeCount, SortDirection::Asc);
        let trades: Vec<u32> = board.results().iter().map(|r| r.kpis.trade_count).collect();
        assert_eq!(trades, vec![3, 5, 7]);
    }

    #[test]
    fn test_entries_mirror_results_order() {
        let mut board = Leaderboard::new(3, SortColumn::WinRate, SortDirection::Desc);
        board.admit(make_result(0.0, 0.0, 2));
        board.admit(make_result(0.0, 0.0, 8));
        let entries = board.entries();
        assert_eq!(entries.len(), 2);
        for (entry, result) in entries.iter().zip(board.results()) {
            assert_eq!(entry.kpis.trade_count, result.kpis.trade_count);
        }
    }

    #[test]
    fn test_clear_empties_board() {
        let mut board = Leaderboard::new(3, SortColumn::RobustnessRatio, SortDirection::Desc);
        board.admit(make_result(10.0, 0.0, 1));
        board.clear();
        assert!(board.is_empty());
        assert!(board.admit(make_result(1.0, 0.0, 1)), "cleared board admits again");
    }
}
