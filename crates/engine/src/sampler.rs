//! Candidate generation: the parameter space, user locks, and the draw
//! that turns both plus the learned constraints into concrete settings.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constraints::{ConstraintSet, ParamConstraint};
use crate::types::{
    Factor, FactorKey, FilterSettings, ParameterKey, RatioWeights, StrategyMode, StrategySettings,
};

// ============================================================================
// Parameter ranges
// ============================================================================

/// Inclusive value range on a step lattice
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    pub const fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    /// Uniform draw over the whole lattice
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        self.sample_within(self.min, self.max, rng)
    }

    /// Uniform draw restricted to `[lo, hi]`, clamped into the range.
    /// A collapsed or inverted restriction yields its lower edge.
    pub fn sample_within(&self, lo: f64, hi: f64, rng: &mut impl Rng) -> f64 {
        let lo = lo.max(self.min);
        let hi = hi.min(self.max);
        if hi <= lo {
            return self.round_to_step(lo);
        }
        if self.step >= 1.0 {
            let (lo, hi) = (lo.ceil() as i64, hi.floor() as i64);
            if hi < lo {
                return self.round_to_step(lo as f64);
            }
            rng.gen_range(lo..=hi) as f64
        } else {
            let steps = ((hi - lo) / self.step).floor() as i64;
            let raw = lo + rng.gen_range(0..=steps) as f64 * self.step;
            self.round_to_step(raw)
        }
    }

    /// Every lattice value in order. Used to enumerate filter-rule grids.
    pub fn values(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.max < self.min {
            return Vec::new();
        }
        let raw = (self.max - self.min) / self.step;
        let steps = if (raw - raw.round()).abs() < 1e-6 {
            raw.round()
        } else {
            raw.floor()
        } as i64;
        (0..=steps)
            .map(|i| self.round_to_step(self.min + i as f64 * self.step))
            .collect()
    }

    fn round_to_step(&self, value: f64) -> f64 {
        if self.step <= 0.0 {
            value
        } else if self.step >= 1.0 {
            value.round()
        } else {
            let scale = (1.0 / self.step).round();
            (value * scale).round() / scale
        }
    }
}

// ============================================================================
// Parameter space
// ============================================================================

/// Search space for every sampled parameter, plus the filter-rule axes the
/// walk-forward grid enumerates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub pattern_length: ParameterRange,
    pub holding_period: ParameterRange,
    pub lookback: ParameterRange,
    pub tolerance: ParameterRange,
    pub min_occurrences: ParameterRange,
    pub max_occurrences: ParameterRange,
    pub trade_lookback: ParameterRange,
    pub min_performance: ParameterRange,
    /// How many factors a candidate combines, absent learned bounds
    pub factor_count: (usize, usize),
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            pattern_length: ParameterRange::new(1.0, 5.0, 1.0),
            holding_period: ParameterRange::new(1.0, 5.0, 1.0),
            lookback: ParameterRange::new(10.0, 500.0, 1.0),
            tolerance: ParameterRange::new(0.0, 5.0, 1.0),
            min_occurrences: ParameterRange::new(1.0, 100.0, 1.0),
            max_occurrences: ParameterRange::new(1.0, 100.0, 1.0),
            trade_lookback: ParameterRange::new(1.0, 20.0, 1.0),
            min_performance: ParameterRange::new(-1.0, 2.0, 0.1),
            factor_count: (1, 5),
        }
    }
}

impl ParameterSpace {
    pub fn range(&self, key: ParameterKey) -> ParameterRange {
        match key {
            ParameterKey::PatternLength => self.pattern_length,
            ParameterKey::HoldingPeriod => self.holding_period,
            ParameterKey::Lookback => self.lookback,
            ParameterKey::Tolerance => self.tolerance,
            ParameterKey::MinOccurrences => self.min_occurrences,
            ParameterKey::MaxOccurrences => self.max_occurrences,
        }
    }
}

// ============================================================================
// User locks
// ============================================================================

/// User-pinned parts of a candidate. Locked params are never sampled,
/// locked factors are always included with their given weight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplerLocks {
    pub params: BTreeMap<ParameterKey, f64>,
    pub factors: Vec<Factor>,
    pub mode: Option<StrategyMode>,
}

// ============================================================================
// Candidate draw
// ============================================================================

fn draw_param(
    space: &ParameterSpace,
    locks: &SamplerLocks,
    constraints: &ConstraintSet,
    key: ParameterKey,
    rng: &mut impl Rng,
) -> f64 {
    if let Some(&value) = locks.params.get(&key) {
        return value;
    }
    let range = space.range(key);
    match constraints.get(key) {
        ParamConstraint::Locked { value } => value,
        ParamConstraint::Range { min, max } => range.sample_within(min, max, rng),
        ParamConstraint::Unconstrained => range.sample(rng),
    }
}

/// `max_occurrences` gets its own draw so the pair stays ordered no matter
/// what locks or learned ranges say
fn draw_max_occurrences(
    space: &ParameterSpace,
    locks: &SamplerLocks,
    constraints: &ConstraintSet,
    min_occurrences: usize,
    rng: &mut impl Rng,
) -> usize {
    let floor = min_occurrences as f64;
    if let Some(&value) = locks.params.get(&ParameterKey::MaxOccurrences) {
        return value.max(floor) as usize;
    }
    let range = space.max_occurrences;
    match constraints.get(ParameterKey::MaxOccurrences) {
        ParamConstraint::Locked { value } => value.max(floor) as usize,
        ParamConstraint::Range { min, max } => {
            range.sample_within(min.max(floor), max.max(floor), rng) as usize
        }
        ParamConstraint::Unconstrained => range.sample_within(floor, range.max, rng) as usize,
    }
}

/// Draw one candidate honoring user locks first, learned constraints second
/// and the full space last. The similarity filter always starts disabled,
/// filter rules only enter through the walk-forward grid.
pub fn sample_settings(
    space: &ParameterSpace,
    locks: &SamplerLocks,
    constraints: &ConstraintSet,
    ratio_weights: RatioWeights,
    rng: &mut impl Rng,
) -> StrategySettings {
    let pattern_length = draw_param(space, locks, constraints, ParameterKey::PatternLength, rng) as usize;
    let holding_period = draw_param(space, locks, constraints, ParameterKey::HoldingPeriod, rng) as usize;
    let lookback = draw_param(space, locks, constraints, ParameterKey::Lookback, rng) as usize;
    let tolerance = draw_param(space, locks, constraints, ParameterKey::Tolerance, rng);
    let min_occurrences = draw_param(space, locks, constraints, ParameterKey::MinOccurrences, rng) as usize;
    let max_occurrences = draw_max_occurrences(space, locks, constraints, min_occurrences, rng);

    let (count_min, count_max) = constraints.num_factors.unwrap_or(space.factor_count);
    let count_max = count_max.min(FactorKey::ALL.len()).max(1);
    let count_min = count_min.clamp(1, count_max);
    let target = if count_min == count_max {
        count_min
    } else {
        rng.gen_range(count_min..=count_max)
    };

    let mut factors: Vec<Factor> = locks.factors.clone();
    for key in &constraints.locked_factors {
        if !factors.iter().any(|f| f.key == *key) {
            factors.push(Factor {
                key: *key,
                weight: rng.gen_range(1..=100) as f64,
            });
        }
    }
    let mut remaining: Vec<FactorKey> = FactorKey::ALL
        .iter()
        .copied()
        .filter(|key| !factors.iter().any(|f| f.key == *key))
        .collect();
    while factors.len() < target && !remaining.is_empty() {
        let idx = rng.gen_range(0..remaining.len());
        let key = remaining.remove(idx);
        factors.push(Factor {
            key,
            weight: rng.gen_range(1..=100) as f64,
        });
    }

    let mode = match locks.mode {
        Some(mode) => mode,
        None if rng.gen_bool(0.5) => StrategyMode::Trend,
        None => StrategyMode::Reversion,
    };

    StrategySettings {
        pattern_length,
        holding_period,
        lookback,
        tolerance,
        min_occurrences,
        max_occurrences,
        factors,
        mode,
        filter: FilterSettings::default(),
        ratio_weights,
    }
}

// ============================================================================
// Tests
// ============================================================================
