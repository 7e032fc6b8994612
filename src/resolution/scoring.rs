// 🎯 Match Scoring - pairwise match probability for two canon keys of one block
//
// Default model: Fellegi–Sunter over tiered Levenshtein comparison levels
// (exact, ≤1, ≤2, ≤3, else). Each level has an m probability (P(level | match))
// and a u probability (P(level | non-match)); together with the prior match
// rate they give the posterior match probability of a pair.

use serde::{Deserialize, Serialize};

/// Number of comparison levels: distance 0, 1, 2, 3, more
pub const LEVELS: usize = 5;

/// Smoothing mass added to every level during EM
const PSEUDO_COUNT: f64 = 0.5;

/// Anything able to turn a pair of canon keys into a probability in [0, 1].
/// Only pairs that share a block are ever scored.
pub trait MatchScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;

    /// Re-estimate parameters from the candidate pairs of one column.
    /// Returns `None` when the scorer has nothing to learn.
    fn fit(&self, _pairs: &[(&str, &str)]) -> Option<Box<dyn MatchScorer>> {
        None
    }
}

/// Comparison level of two keys
pub fn comparison_level(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    strsim::levenshtein(a, b).min(LEVELS - 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FellegiSunter {
    /// P(level | match), per level
    pub m: [f64; LEVELS],

    /// P(level | non-match), per level
    pub u: [f64; LEVELS],

    /// Prior probability that a candidate pair is a match
    pub prior: f64,

    /// EM iterations run by `fit` (0 = fixed parameters)
    pub em_iterations: usize,
}

impl FellegiSunter {
    /// Model with the default parameters
    pub fn new() -> Self {
        FellegiSunter {
            m: [0.90, 0.07, 0.02, 0.005, 0.005],
            u: [0.001, 0.002, 0.01, 0.02, 0.967],
            prior: 0.3,
            em_iterations: 0,
        }
    }

    pub fn with_em_iterations(mut self, iterations: usize) -> Self {
        self.em_iterations = iterations;
        self
    }

    /// Posterior match probability per level, clamped so that it never
    /// increases with edit distance
    pub fn level_probabilities(&self) -> [f64; LEVELS] {
        let mut probs = [0.0; LEVELS];
        for k in 0..LEVELS {
            let matched = self.prior * self.m[k];
            let unmatched = (1.0 - self.prior) * self.u[k];
            let total = matched + unmatched;
            probs[k] = if total > 0.0 { matched / total } else { 0.0 };
            if k > 0 && probs[k] > probs[k - 1] {
                probs[k] = probs[k - 1];
            }
        }
        probs
    }

    /// Expectation–maximisation over observed comparison levels
    pub fn estimate(&self, levels: &[usize]) -> FellegiSunter {
        let mut model = self.clone();
        if levels.is_empty() {
            return model;
        }
        let n = levels.len() as f64;

        for _ in 0..self.em_iterations {
            let posterior = model.level_probabilities();

            let mut weight_m = [0.0; LEVELS];
            let mut weight_u = [0.0; LEVELS];
            for &k in levels {
                weight_m[k] += posterior[k];
                weight_u[k] += 1.0 - posterior[k];
            }

            let sum_m: f64 = weight_m.iter().sum();
            let sum_u: f64 = weight_u.iter().sum();
            let smoothing = PSEUDO_COUNT * LEVELS as f64;
            for k in 0..LEVELS {
                model.m[k] = (weight_m[k] + PSEUDO_COUNT) / (sum_m + smoothing);
                model.u[k] = (weight_u[k] + PSEUDO_COUNT) / (sum_u + smoothing);
            }
            model.prior = (sum_m / n).clamp(1e-4, 1.0 - 1e-4);
        }

        model
    }
}

impl Default for FellegiSunter {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchScorer for FellegiSunter {
    fn score(&self, a: &str, b: &str) -> f64 {
        self.level_probabilities()[comparison_level(a, b)]
    }

    fn fit(&self, pairs: &[(&str, &str)]) -> Option<Box<dyn MatchScorer>> {
        if self.em_iterations == 0 || pairs.is_empty() {
            return None;
        }
        let levels: Vec<usize> = pairs.iter().map(|(a, b)| comparison_level(a, b)).collect();
        Some(Box::new(self.estimate(&levels)))
    }
}

// ============================================================================
// TESTS
// ============================================================================
