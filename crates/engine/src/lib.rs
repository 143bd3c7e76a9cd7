//! Pattern Miner Engine — pattern matching, simulation, and strategy search
//!
//! Everything the CLI needs to turn a daily OHLCV series into ranked
//! trading strategies:
//! - Decile-ranked feature derivation (fit on one dataset, apply to another)
//! - Similarity-matched single-position simulator with KPI scoring
//! - Concurrent adaptive random search with learned sampling constraints
//! - Walk-forward meta-optimizer over signal-performance filter rules
//! - Robustness-weight sensitivity analysis

pub mod constraints;
pub mod error;
pub mod features;
pub mod kpi;
pub mod leaderboard;
pub mod meta;
pub mod optimizer;
pub mod sampler;
pub mod simulator;
pub mod types;
pub mod weights;

// Re-exports for convenience
pub use constraints::{ConstraintKey, ConstraintSet, ParamConstraint};
pub use error::EngineError;
pub use features::{benchmark_daily_return, derive_metrics, prepare_features, BinSet, FeatureSeries};
pub use leaderboard::{Leaderboard, LeaderboardEntry, SortColumn, SortDirection};
pub use meta::{
    rank_analysis, run_meta_optimization, run_robustness_check, FilterGrid, MetaEvent, MetaReport,
    MetaRequest, MetaResult, MetaRule, RankAnalysis, RankBucket, RobustnessRow,
};
pub use optimizer::{
    OptimizerEvent, OptimizerOptions, OptimizerState, OptimizerStatus, SearchOptimizer,
};
pub use sampler::{sample_settings, ParameterRange, ParameterSpace, SamplerLocks};
pub use simulator::simulate;
pub use types::*;
pub use weights::{run_weights_analysis, WeightSample};
