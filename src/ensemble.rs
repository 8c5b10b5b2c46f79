//! Bagged CART regression trees for per-account spend

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::features::{FeatureTable, TXN_COUNT};
use crate::metrics::RegressionMetrics;

/// Bagged tree ensemble settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Number of trees in the ensemble
    pub n_trees: usize,
    /// Maximum depth of each tree
    pub max_depth: usize,
    /// Minimum samples in a leaf
    pub min_samples_leaf: usize,
    /// Features tried per split (a third of all features if None)
    pub max_features: Option<usize>,
    /// Base seed; tree `i` draws from `seed + i`
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_trees: 50,
            max_depth: 6,
            min_samples_leaf: 5,
            max_features: None,
            seed: 42,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.n_trees == 0 {
            return Err(PipelineError::Config("regressor.n_trees must be at least 1".into()));
        }
        if self.max_depth == 0 || self.min_samples_leaf == 0 {
            return Err(PipelineError::Config(
                "regressor.max_depth and regressor.min_samples_leaf must be at least 1".into(),
            ));
        }
        if self.max_features == Some(0) {
            return Err(PipelineError::Config("regressor.max_features must be at least 1".into()));
        }
        Ok(())
    }

    fn features_per_split(&self, n_features: usize) -> usize {
        self.max_features
            .unwrap_or(n_features / 3)
            .clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// CART regression tree grown on variance reduction
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    root: Node,
}

struct Grower<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    max_depth: usize,
    min_samples_leaf: usize,
    features_per_split: usize,
}

impl RegressionTree {
    /// Grow a tree on the rows listed in `indices` (repeats allowed)
    pub fn fit<'a>(
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, f64>,
        indices: &[usize],
        config: &EnsembleConfig,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let grower = Grower {
            x,
            y,
            max_depth: config.max_depth,
            min_samples_leaf: config.min_samples_leaf,
            features_per_split: config.features_per_split(x.ncols()),
        };
        let mut indices = indices.to_vec();
        Self {
            root: grower.grow(&mut indices, 0, rng),
        }
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf(value) => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(node: &Node) -> usize {
            match node {
                Node::Leaf(_) => 0,
                Node::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }
}

impl Grower<'_> {
    fn grow(&self, indices: &mut [usize], depth: usize, rng: &mut ChaCha8Rng) -> Node {
        let mean = mean_of(self.y, indices);
        if depth >= self.max_depth || indices.len() < 2 * self.min_samples_leaf {
            return Node::Leaf(mean);
        }

        let Some((feature, threshold)) = self.best_split(indices, rng) else {
            return Node::Leaf(mean);
        };

        let (mut left, mut right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| self.x[[i, feature]] <= threshold);

        Node::Split {
            feature,
            threshold,
            left: Box::new(self.grow(&mut left, depth + 1, rng)),
            right: Box::new(self.grow(&mut right, depth + 1, rng)),
        }
    }

    /// Split maximising `sum_l^2 / n_l + sum_r^2 / n_r`, i.e. minimising SSE
    fn best_split(&self, indices: &mut [usize], rng: &mut ChaCha8Rng) -> Option<(usize, f64)> {
        let n = indices.len();
        let total: f64 = indices.iter().map(|&i| self.y[i]).sum();
        let parent_score = total * total / n as f64;

        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);
        features.truncate(self.features_per_split);

        let mut best: Option<(usize, f64, f64)> = None;
        for &feature in &features {
            indices.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));

            let mut left_sum = 0.0;
            for split in 1..n {
                left_sum += self.y[indices[split - 1]];
                let lo = self.x[[indices[split - 1], feature]];
                let hi = self.x[[indices[split], feature]];
                if lo == hi || split < self.min_samples_leaf || n - split < self.min_samples_leaf {
                    continue;
                }

                let right_sum = total - left_sum;
                let score = left_sum * left_sum / split as f64
                    + right_sum * right_sum / (n - split) as f64;
                if score > parent_score + 1e-12 && best.map_or(true, |(_, _, s)| score > s) {
                    best = Some((feature, lo + (hi - lo) / 2.0, score));
                }
            }
        }

        best.map(|(feature, threshold, _)| (feature, threshold))
    }
}

fn mean_of(y: ArrayView1<f64>, indices: &[usize]) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    indices.iter().map(|&i| y[i]).sum::<f64>() / indices.len() as f64
}

/// Mean of `n_trees` trees, each grown on a bootstrap sample
#[derive(Debug, Clone, PartialEq)]
pub struct BaggedTrees {
    trees: Vec<RegressionTree>,
}

impl BaggedTrees {
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, config: &EnsembleConfig) -> crate::Result<Self> {
        config.validate()?;
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(PipelineError::Model(format!(
                "cannot fit trees on {} rows with {} labels",
                n,
                y.len()
            ))
            .into());
        }

        let trees = (0..config.n_trees)
            .map(|i| {
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(i as u64));
                let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x.view(), y.view(), &sample, config, &mut rng)
            })
            .collect();

        Ok(Self { trees })
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.outer_iter()
            .map(|row| {
                self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / self.trees.len() as f64
            })
            .collect()
    }
}

/// Seeded shuffle split into `(train, test)` row indices
pub fn shuffle_split(n: usize, test_fraction: f64, seed: u64) -> crate::Result<(Vec<usize>, Vec<usize>)> {
    if n < 2 {
        return Err(PipelineError::Model(format!("need at least 2 rows to split, got {}", n)).into());
    }
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

    let n_test = ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1);
    let test = indices.split_off(n - n_test);
    Ok((indices, test))
}

/// Fitted spend model with held-out error and per-account predictions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendModel {
    pub features: Vec<String>,
    pub n_train: usize,
    pub n_test: usize,
    pub metrics: RegressionMetrics,
    /// Predicted label-window spend for each account in the scoring table
    #[serde(skip)]
    pub predictions: BTreeMap<String, f64>,
}

/// Fit on `train` (features before its label window) and score `score`
///
/// `score` is the same feature layout built at a later boundary, so its
/// predictions look past the most recent history.
pub fn train_spend_model(
    train: &FeatureTable,
    score: &FeatureTable,
    config: &EnsembleConfig,
    test_fraction: f64,
    seed: u64,
) -> crate::Result<SpendModel> {
    let (train_idx, test_idx) = shuffle_split(train.len(), test_fraction, seed)?;

    let x = train.select(&train.columns)?;
    let x_train = x.select(Axis(0), &train_idx);
    let y_train = train.label.select(Axis(0), &train_idx);
    let x_test = x.select(Axis(0), &test_idx);
    let y_test = train.label.select(Axis(0), &test_idx);

    let model = BaggedTrees::fit(&x_train, &y_train, config)?;
    let predicted = model.predict(&x_test);
    let metrics = RegressionMetrics::compute(
        y_test.as_slice().unwrap_or_default(),
        predicted.as_slice().unwrap_or_default(),
    );

    log::info!(
        "Spend model: {} trees, {} train / {} test rows, rmse={:.2} mae={:.2}",
        model.n_trees(),
        train_idx.len(),
        test_idx.len(),
        metrics.rmse,
        metrics.mae
    );

    // accounts with no transactions in the scoring windows get no prediction
    let scored = model.predict(&score.select(&train.columns)?);
    let activity = score.select(&[TXN_COUNT])?;
    let predictions: BTreeMap<String, f64> = score
        .account_ids
        .iter()
        .zip(scored.iter().zip(activity.column(0)))
        .filter(|(_, (_, &count))| count > 0.0)
        .map(|(id, (&spend, _))| (id.clone(), spend))
        .collect();
    let inactive = score.len() - predictions.len();
    if inactive > 0 {
        log::info!("{} accounts have no transaction history and are not scored", inactive);
    }

    Ok(SpendModel {
        features: train.columns.clone(),
        n_train: train_idx.len(),
        n_test: test_idx.len(),
        metrics,
        predictions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ndarray::array;

    fn table(n: usize, offset: f64) -> FeatureTable {
        let columns = vec!["spend_1m".to_string(), "txn_count".to_string()];
        let mut values = Array2::zeros((n, 2));
        let mut label = Array1::zeros(n);
        for i in 0..n {
            let spend = (i % 10) as f64 * 100.0 + offset;
            values[[i, 0]] = spend;
            values[[i, 1]] = (i % 3 + 1) as f64;
            label[i] = 2.0 * spend;
        }
        FeatureTable {
            boundary: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            account_ids: (0..n).map(|i| format!("A{:03}", i)).collect(),
            statuses: vec!["open".to_string(); n],
            had_fraud: vec![false; n],
            columns,
            values,
            label,
        }
    }

    #[test]
    fn test_tree_learns_step() {
        let x = Array2::from_shape_fn((20, 1), |(i, _)| i as f64);
        let y: Array1<f64> = (0..20).map(|i| if i < 10 { 1.0 } else { 5.0 }).collect();
        let config = EnsembleConfig {
            max_depth: 2,
            min_samples_leaf: 1,
            max_features: Some(1),
            ..EnsembleConfig::default()
        };
        let indices: Vec<usize> = (0..20).collect();

        let tree = RegressionTree::fit(
            x.view(),
            y.view(),
            &indices,
            &config,
            &mut ChaCha8Rng::seed_from_u64(0),
        );

        assert_eq!(tree.predict_row(array![3.0].view()), 1.0);
        assert_eq!(tree.predict_row(array![15.0].view()), 5.0);
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_constant_target_is_single_leaf() {
        let x = Array2::from_shape_fn((12, 2), |(i, j)| (i * (j + 1)) as f64);
        let y = Array1::from_elem(12, 7.0);
        let indices: Vec<usize> = (0..12).collect();

        let tree = RegressionTree::fit(
            x.view(),
            y.view(),
            &indices,
            &EnsembleConfig::default(),
            &mut ChaCha8Rng::seed_from_u64(0),
        );

        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict_row(array![100.0, 100.0].view()), 7.0);
    }

    #[test]
    fn test_bagged_trees_deterministic() {
        let t = table(60, 0.0);
        let config = EnsembleConfig {
            n_trees: 10,
            ..EnsembleConfig::default()
        };

        let a = BaggedTrees::fit(&t.values, &t.label, &config).unwrap();
        let b = BaggedTrees::fit(&t.values, &t.label, &config).unwrap();

        assert_eq!(a.n_trees(), 10);
        assert_eq!(a.predict(&t.values), b.predict(&t.values));
    }

    #[test]
    fn test_zero_trees_rejected() {
        let t = table(10, 0.0);
        let config = EnsembleConfig {
            n_trees: 0,
            ..EnsembleConfig::default()
        };
        assert!(BaggedTrees::fit(&t.values, &t.label, &config).is_err());
    }

    #[test]
    fn test_shuffle_split() {
        let (train, test) = shuffle_split(10, 0.2, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);

        let mut all: Vec<usize> = train.iter().chain(&test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        assert_eq!(shuffle_split(10, 0.2, 42).unwrap(), (train, test));
        assert!(shuffle_split(1, 0.2, 42).is_err());
    }

    #[test]
    fn test_train_spend_model_scores_every_account() {
        let train = table(80, 0.0);
        let score = table(30, 50.0);
        let config = EnsembleConfig {
            n_trees: 20,
            min_samples_leaf: 2,
            ..EnsembleConfig::default()
        };

        let model = train_spend_model(&train, &score, &config, 0.25, 7).unwrap();

        assert_eq!(model.n_train + model.n_test, 80);
        assert_eq!(model.n_test, 20);
        assert_eq!(model.predictions.len(), 30);
        assert!(model.predictions.contains_key("A000"));
        assert!(model.metrics.rmse.is_finite());
        // label spans 0..1800; a useful model does far better than its range
        assert!(model.metrics.mae < 400.0, "mae = {}", model.metrics.mae);
    }

    #[test]
    fn test_inactive_accounts_are_not_scored() {
        let train = table(40, 0.0);
        let mut score = table(10, 0.0);
        score.values[[3, 1]] = 0.0;
        score.values[[7, 1]] = 0.0;
        let config = EnsembleConfig {
            n_trees: 5,
            ..EnsembleConfig::default()
        };

        let model = train_spend_model(&train, &score, &config, 0.25, 7).unwrap();

        assert_eq!(model.predictions.len(), 8);
        assert!(!model.predictions.contains_key("A003"));
        assert!(!model.predictions.contains_key("A007"));
        assert!(model.predictions.contains_key("A000"));
    }
}
