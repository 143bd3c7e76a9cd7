//! Core data model: candles, derived features, strategy settings, results

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Starting cash for every simulation
pub const START_CAPITAL: f64 = 10_000.0;

/// A single daily candlestick (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One of the six daily metrics a strategy can weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKey {
    Change,
    ClosePos,
    VolumeChange,
    AbsoluteVolume,
    UpperStrength,
    LowerStrength,
}

impl FactorKey {
    pub const ALL: [FactorKey; 6] = [
        FactorKey::Change,
        FactorKey::ClosePos,
        FactorKey::VolumeChange,
        FactorKey::AbsoluteVolume,
        FactorKey::UpperStrength,
        FactorKey::LowerStrength,
    ];

    /// Position in rank/metric arrays
    pub fn index(self) -> usize {
        match self {
            FactorKey::Change => 0,
            FactorKey::ClosePos => 1,
            FactorKey::VolumeChange => 2,
            FactorKey::AbsoluteVolume => 3,
            FactorKey::UpperStrength => 4,
            FactorKey::LowerStrength => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FactorKey::Change => "Change %",
            FactorKey::ClosePos => "Close Position",
            FactorKey::VolumeChange => "Volume Change %",
            FactorKey::AbsoluteVolume => "Volume",
            FactorKey::UpperStrength => "Upper Strength",
            FactorKey::LowerStrength => "Lower Strength",
        }
    }
}

/// The six metric values derived for one day
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub change: f64,
    pub close_pos: f64,
    pub volume_change: f64,
    pub absolute_volume: f64,
    pub upper_strength: f64,
    pub lower_strength: f64,
}

impl Metrics {
    pub fn get(&self, key: FactorKey) -> f64 {
        match key {
            FactorKey::Change => self.change,
            FactorKey::ClosePos => self.close_pos,
            FactorKey::VolumeChange => self.volume_change,
            FactorKey::AbsoluteVolume => self.absolute_volume,
            FactorKey::UpperStrength => self.upper_strength,
            FactorKey::LowerStrength => self.lower_strength,
        }
    }
}

/// Decile ranks (0..9) for one day, indexed by [`FactorKey::index`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranks(pub [u8; 6]);

impl Ranks {
    pub fn get(&self, key: FactorKey) -> u8 {
        self.0[key.index()]
    }
}

/// A derived day before binning: metrics plus the prices the simulator needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub index: usize,
    pub date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub metrics: Metrics,
}

/// A fully prepared day: metrics, decile ranks and forward returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRow {
    pub index: usize,
    pub date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub metrics: Metrics,
    pub ranks: Ranks,
    /// Percent return over holding periods 1..=5; 0.0 where the horizon
    /// runs past the end of the series
    pub future_returns: [f64; 5],
}

impl FeatureRow {
    /// Forward return for a holding period in days (1..=5)
    pub fn future_return(&self, holding_period: usize) -> f64 {
        self.future_returns
            .get(holding_period.wrapping_sub(1))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Whether matched outcomes are traded with or against their sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    Trend,
    Reversion,
}

impl StrategyMode {
    pub fn label(&self) -> &'static str {
        match self {
            StrategyMode::Trend => "Trend",
            StrategyMode::Reversion => "Reversion",
        }
    }
}

/// A metric and its matching weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub key: FactorKey,
    pub weight: f64,
}

/// Trailing signal-performance filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub enabled: bool,
    /// How many prior signals to inspect
    pub trade_lookback: usize,
    /// Minimum average daily return of resolved prior signals
    pub min_performance: f64,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            trade_lookback: 5,
            min_performance: 0.1,
        }
    }
}

/// Weights for the five robustness sub-scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioWeights {
    pub annual_return: f64,
    pub avg_daily_trade_return: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub longest_drawdown_duration: f64,
}

impl Default for RatioWeights {
    fn default() -> Self {
        Self {
            annual_return: 20.0,
            avg_daily_trade_return: 20.0,
            win_rate: 20.0,
            max_drawdown: 20.0,
            longest_drawdown_duration: 20.0,
        }
    }
}

impl RatioWeights {
    pub fn total(&self) -> f64 {
        self.annual_return
            + self.avg_daily_trade_return
            + self.win_rate
            + self.max_drawdown
            + self.longest_drawdown_duration
    }

    pub fn as_array(&self) -> [f64; 5] {
        [
            self.annual_return,
            self.avg_daily_trade_return,
            self.win_rate,
            self.max_drawdown,
            self.longest_drawdown_duration,
        ]
    }

    pub fn from_array(values: [f64; 5]) -> Self {
        Self {
            annual_return: values[0],
            avg_daily_trade_return: values[1],
            win_rate: values[2],
            max_drawdown: values[3],
            longest_drawdown_duration: values[4],
        }
    }
}

/// Full parameterization of one strategy candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Days in the rank-pattern window (1..=5)
    pub pattern_length: usize,
    /// Days a position is held (1..=5)
    pub holding_period: usize,
    /// Days of history a pattern must clear before it may match
    pub lookback: usize,
    /// Maximum average weighted rank distance per factor
    pub tolerance: f64,
    pub min_occurrences: usize,
    pub max_occurrences: usize,
    pub factors: Vec<Factor>,
    pub mode: StrategyMode,
    pub filter: FilterSettings,
    pub ratio_weights: RatioWeights,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            pattern_length: 1,
            holding_period: 1,
            lookback: 100,
            tolerance: 1.0,
            min_occurrences: 5,
            max_occurrences: 50,
            factors: vec![
                Factor {
                    key: FactorKey::Change,
                    weight: 100.0,
                },
                Factor {
                    key: FactorKey::AbsoluteVolume,
                    weight: 100.0,
                },
            ],
            mode: StrategyMode::Trend,
            filter: FilterSettings::default(),
            ratio_weights: RatioWeights::default(),
        }
    }
}

/// A strategy parameter the optimizer samples, constrains or locks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKey {
    PatternLength,
    HoldingPeriod,
    Lookback,
    Tolerance,
    MinOccurrences,
    MaxOccurrences,
}

impl ParameterKey {
    pub const ALL: [ParameterKey; 6] = [
        ParameterKey::PatternLength,
        ParameterKey::HoldingPeriod,
        ParameterKey::Lookback,
        ParameterKey::Tolerance,
        ParameterKey::MinOccurrences,
        ParameterKey::MaxOccurrences,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ParameterKey::PatternLength => "Pattern Length",
            ParameterKey::HoldingPeriod => "Holding Period",
            ParameterKey::Lookback => "Lookback",
            ParameterKey::Tolerance => "Tolerance",
            ParameterKey::MinOccurrences => "Min Occurrences",
            ParameterKey::MaxOccurrences => "Max Occurrences",
        }
    }

    /// Read this parameter's value out of concrete settings
    pub fn value_of(&self, settings: &StrategySettings) -> f64 {
        match self {
            ParameterKey::PatternLength => settings.pattern_length as f64,
            ParameterKey::HoldingPeriod => settings.holding_period as f64,
            ParameterKey::Lookback => settings.lookback as f64,
            ParameterKey::Tolerance => settings.tolerance,
            ParameterKey::MinOccurrences => settings.min_occurrences as f64,
            ParameterKey::MaxOccurrences => settings.max_occurrences as f64,
        }
    }
}

/// Side of a logged fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

/// A single fill in chronological order
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeLogEntry {
    pub date: NaiveDate,
    pub action: TradeAction,
    pub price: f64,
}

/// A buy paired with its sell
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub buy_date: NaiveDate,
    pub buy_price: f64,
    pub sell_date: NaiveDate,
    pub sell_price: f64,
    /// Fractional return, e.g. 0.02 for +2%
    pub return_pct: f64,
}

/// A point on the daily equity curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Headline figures of one simulation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KpiSet {
    pub final_value: f64,
    /// CAGR in percent
    pub annual_return: f64,
    pub trade_count: u32,
    /// Percent of completed trades that won
    pub win_rate: f64,
    /// Mean completed-trade return in percent
    pub avg_trade_return: f64,
    /// `avg_trade_return` per held day
    pub avg_daily_trade_return: f64,
    /// Peak-to-trough fraction, 0..1
    pub max_drawdown: f64,
    /// Longest stretch below a peak, in days
    pub longest_drawdown_duration: f64,
    /// Weighted composite score, usually 0..100
    pub robustness_ratio: f64,
}

/// Everything one simulation produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub settings: StrategySettings,
    pub kpis: KpiSet,
    pub equity_curve: Vec<EquityPoint>,
    pub completed_trades: Vec<CompletedTrade>,
}

// ============================================================================
// Tests
// ============================================================================
