//! Learned sampling constraints.
//!
//! While a search is running, the leaderboard is periodically mined for
//! structure: parameter ranges that keep producing admitted strategies are
//! narrowed and factors that almost every survivor uses become mandatory.
//! User-locked parameters are constraints too, they just never move.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{FactorKey, ParameterKey, StrategySettings};

// ============================================================================
// Constants
// ============================================================================

/// Leaderboard entries required before a learning pass draws conclusions
pub const MIN_LEARNING_RESULTS: usize = 5;

/// Share of leaderboard entries that must carry a factor before it is locked
pub const FACTOR_ADOPTION_THRESHOLD: f64 = 0.9;

// ============================================================================
// Types
// ============================================================================

/// Constraint applied to a single parameter when sampling candidates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamConstraint {
    /// Sample from the full parameter space
    Unconstrained,
    /// Learned band, sample within it
    Range { min: f64, max: f64 },
    /// User-pinned value, never sampled and never re-learned
    Locked { value: f64 },
}

/// Addressable slot inside a [`ConstraintSet`], used for targeted removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKey {
    Param(ParameterKey),
    NumFactors,
    LockedFactors,
}

/// The full picture the sampler consults on every draw
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintSet {
    params: BTreeMap<ParameterKey, ParamConstraint>,
    /// Learned bounds on how many factors a candidate should combine
    pub num_factors: Option<(usize, usize)>,
    /// Factors every candidate must include
    pub locked_factors: Vec<FactorKey>,
    /// Completed learning passes
    pub phase: u32,
}

impl ConstraintSet {
    /// Constraint for a parameter, absent entries mean unconstrained
    pub fn get(&self, key: ParameterKey) -> ParamConstraint {
        self.params
            .get(&key)
            .copied()
            .unwrap_or(ParamConstraint::Unconstrained)
    }

    /// Pin a parameter to a fixed value
    pub fn lock(&mut self, key: ParameterKey, value: f64) {
        self.params.insert(key, ParamConstraint::Locked { value });
    }

    pub fn is_locked(&self, key: ParameterKey) -> bool {
        matches!(self.get(key), ParamConstraint::Locked { .. })
    }

    /// Drop one constraint. Learned ranges go back to unconstrained, user
    /// locks stay put. The next learning pass may re-derive what it removed.
    pub fn remove(&mut self, key: ConstraintKey) {
        match key {
            ConstraintKey::Param(param) => {
                if matches!(self.params.get(&param), Some(ParamConstraint::Range { .. })) {
                    self.params.remove(&param);
                }
            }
            ConstraintKey::NumFactors => self.num_factors = None,
            ConstraintKey::LockedFactors => self.locked_factors.clear(),
        }
    }

    /// All parameter constraints currently in force
    pub fn params(&self) -> impl Iterator<Item = (ParameterKey, ParamConstraint)> + '_ {
        self.params.iter().map(|(k, v)| (*k, *v))
    }

    /// Mine the given leaderboard settings for structure. Returns whether
    /// anything was learned; below [`MIN_LEARNING_RESULTS`] entries this is
    /// a no-op.
    pub fn learn_from(&mut self, survivors: &[&StrategySettings]) -> bool {
        if survivors.len() < MIN_LEARNING_RESULTS {
            return false;
        }

        for key in ParameterKey::ALL {
            if self.is_locked(key) {
                continue;
            }
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for settings in survivors {
                let value = key.value_of(settings);
                min = min.min(value);
                max = max.max(value);
            }
            self.params.insert(key, ParamConstraint::Range { min, max });
        }

        let mut min_factors = usize::MAX;
        let mut max_factors = 0usize;
        let mut adoption: BTreeMap<FactorKey, usize> = BTreeMap::new();
        for settings in survivors {
            min_factors = min_factors.min(settings.factors.len());
            max_factors = max_factors.max(settings.factors.len());
            for factor in &settings.factors {
                *adoption.entry(factor.key).or_insert(0) += 1;
            }
        }
        self.num_factors = Some((min_factors, max_factors));

        let threshold = survivors.len() as f64 * FACTOR_ADOPTION_THRESHOLD;
        self.locked_factors = adoption
            .into_iter()
            .filter(|(_, count)| *count as f64 >= threshold)
            .map(|(key, _)| key)
            .collect();

        self.phase += 1;
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
