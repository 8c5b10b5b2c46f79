//! Spend tiers and advisory threshold suggestions

use std::collections::BTreeMap;
use std::fmt;

use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Ordinal spending tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Low => "Low",
            Tier::Medium => "Medium",
            Tier::High => "High",
        };
        f.write_str(name)
    }
}

/// Upper bounds of the Low and Medium tiers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub low_max: f64,
    pub medium_max: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low_max: 1000.0,
            medium_max: 10000.0,
        }
    }
}

impl TierThresholds {
    pub fn new(low_max: f64, medium_max: f64) -> Result<Self, PipelineError> {
        let thresholds = Self { low_max, medium_max };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.low_max.is_finite() || !self.medium_max.is_finite() {
            return Err(PipelineError::Config("tier thresholds must be finite".into()));
        }
        if self.low_max >= self.medium_max {
            return Err(PipelineError::Config(format!(
                "tier thresholds must satisfy T1 < T2, got ({}, {})",
                self.low_max, self.medium_max
            )));
        }
        Ok(())
    }

    /// `v <= T1` is Low, `T1 < v <= T2` is Medium, `v > T2` is High
    pub fn assign(&self, value: f64) -> Tier {
        if value > self.medium_max {
            Tier::High
        } else if value > self.low_max {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

/// Number of accounts per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl TierCounts {
    pub fn from_tiers<'a>(tiers: impl IntoIterator<Item = &'a Tier>) -> Self {
        let mut counts = Self::default();
        for tier in tiers {
            match tier {
                Tier::Low => counts.low += 1,
                Tier::Medium => counts.medium += 1,
                Tier::High => counts.high += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.low + self.medium + self.high
    }
}

/// Tier every account; accounts without a prediction land in Low
pub fn segment_accounts(
    account_ids: &[String],
    predictions: &BTreeMap<String, f64>,
    thresholds: &TierThresholds,
) -> BTreeMap<String, Tier> {
    let tiers: BTreeMap<String, Tier> = account_ids
        .iter()
        .map(|id| {
            let tier = predictions
                .get(id)
                .map(|&v| thresholds.assign(v))
                .unwrap_or(Tier::Low);
            (id.clone(), tier)
        })
        .collect();

    let counts = TierCounts::from_tiers(tiers.values());
    log::info!(
        "Tiers (T1={}, T2={}): low={} medium={} high={}",
        thresholds.low_max,
        thresholds.medium_max,
        counts.low,
        counts.medium,
        counts.high
    );
    tiers
}

/// Candidate thresholds from a 3-means clustering of predicted spend
///
/// Returns the midpoints between sorted centroids. Advisory only: nothing
/// applies the result. `None` when the values cannot support three clusters.
pub fn suggest_thresholds(values: &[f64], seed: u64) -> crate::Result<Option<TierThresholds>> {
    let mut distinct: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    if distinct.len() < 3 {
        log::debug!("Skipping threshold suggestion: {} distinct values", distinct.len());
        return Ok(None);
    }

    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let n_samples = finite.len();
    let features = Array2::from_shape_vec((n_samples, 1), finite)?;
    let targets: Array1<usize> = Array1::zeros(n_samples);
    let dataset = Dataset::new(features, targets);

    let model = KMeans::params_with(3, ChaCha8Rng::seed_from_u64(seed), L2Dist)
        .max_n_iterations(300)
        .tolerance(1e-4)
        .fit(&dataset)?;

    let mut centroids: Vec<f64> = model.centroids().column(0).to_vec();
    centroids.sort_by(f64::total_cmp);

    let low_max = (centroids[0] + centroids[1]) / 2.0;
    let medium_max = (centroids[1] + centroids[2]) / 2.0;
    log::debug!("K-Means centroids: {:?}", centroids);

    Ok(TierThresholds::new(low_max, medium_max).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tier_assignment_is_monotonic() {
        let t = TierThresholds::new(1000.0, 10000.0).unwrap();
        let tiers: Vec<Tier> = [500.0, 5000.0, 15000.0].iter().map(|&v| t.assign(v)).collect();
        assert_eq!(tiers, vec![Tier::Low, Tier::Medium, Tier::High]);
    }

    #[test]
    fn test_tier_boundaries_are_inclusive_above() {
        let t = TierThresholds::new(1000.0, 10000.0).unwrap();
        assert_eq!(t.assign(1000.0), Tier::Low);
        assert_eq!(t.assign(1000.01), Tier::Medium);
        assert_eq!(t.assign(10000.0), Tier::Medium);
        assert_eq!(t.assign(10000.01), Tier::High);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        assert!(TierThresholds::new(10000.0, 1000.0).is_err());
        assert!(TierThresholds::new(5.0, 5.0).is_err());
        assert!(TierThresholds::new(f64::NAN, 5.0).is_err());
    }

    #[test]
    fn test_missing_prediction_defaults_to_low() {
        let predictions: BTreeMap<String, f64> =
            [("A1".to_string(), 20000.0), ("A2".to_string(), 5000.0)].into_iter().collect();

        let tiers = segment_accounts(&ids(&["A1", "A2", "A3"]), &predictions, &TierThresholds::default());

        assert_eq!(tiers["A1"], Tier::High);
        assert_eq!(tiers["A2"], Tier::Medium);
        assert_eq!(tiers["A3"], Tier::Low);
        assert_eq!(
            TierCounts::from_tiers(tiers.values()),
            TierCounts { low: 1, medium: 1, high: 1 }
        );
    }

    #[test]
    fn test_suggest_thresholds_separates_groups() {
        let mut values = Vec::new();
        for i in 0..10 {
            values.push(100.0 + i as f64);
            values.push(5000.0 + i as f64);
            values.push(20000.0 + i as f64);
        }

        let t = suggest_thresholds(&values, 42).unwrap().unwrap();

        assert!(t.low_max > 110.0 && t.low_max < 5000.0, "{:?}", t);
        assert!(t.medium_max > 5010.0 && t.medium_max < 20000.0, "{:?}", t);
    }

    #[test]
    fn test_suggest_thresholds_needs_three_values() {
        assert_eq!(suggest_thresholds(&[1.0, 1.0, 2.0], 42).unwrap(), None);
    }
}
