//! Engine error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Candle input too small or empty to derive any feature rows
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    /// Meta-optimizer grid outside the allowed size
    #[error("filter grid has {count} combinations (allowed 1..={max})")]
    CombinationLimitExceeded { count: usize, max: usize },

    /// Walk-forward split fraction outside 0.1..=0.9
    #[error("invalid split fraction {0}, expected 0.1..=0.9")]
    InvalidSplit(f64),
}
