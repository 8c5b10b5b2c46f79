//! Credit-risk labelling and a class-weighted logistic classifier
//!
//! Positives are a small minority, so each class is weighted by
//! `n / (2 * n_class)` during training and the evaluation reports precision,
//! recall and F1 instead of relying on accuracy.
//!
//! The rule inputs `utilization` and `delinquent_cycles` are also classifier
//! features, so the classifier can partly recover the rule from them. Its
//! held-out metrics are optimistic for that reason and measure agreement with
//! the rule, not predictive power on future risk.
//!
//! When the rule labels every account the same way there is nothing to fit.
//! Every account then gets the positive rate as its probability and the
//! evaluation is reported degenerate.

use std::collections::BTreeMap;

use linfa::prelude::*;
use linfa_preprocessing::linear_scaling::LinearScaler;
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::features::{FeatureTable, RISK_FEATURES};
use crate::metrics::ClassificationReport;

/// Rule that turns account facts into the binary risk label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskRule {
    /// Account statuses that count as collections (case-insensitive)
    pub collections_statuses: Vec<String>,
    /// Positive at or above this many delinquent cycles; `None` disables
    pub max_delinquent_cycles: Option<f64>,
    /// Positive at or above this utilization; `None` disables
    pub max_utilization: Option<f64>,
}

impl Default for RiskRule {
    fn default() -> Self {
        Self {
            collections_statuses: vec!["collections".to_string(), "charged_off".to_string()],
            max_delinquent_cycles: Some(3.0),
            max_utilization: Some(0.95),
        }
    }
}

impl RiskRule {
    pub fn label(&self, had_fraud: bool, status: &str, delinquent_cycles: f64, utilization: f64) -> bool {
        if had_fraud {
            return true;
        }
        let status = status.trim();
        self.collections_statuses
            .iter()
            .any(|s| s.eq_ignore_ascii_case(status))
            || self.max_delinquent_cycles.is_some_and(|max| delinquent_cycles >= max)
            || self.max_utilization.is_some_and(|max| utilization >= max)
    }

    /// Label every row of a feature table
    pub fn labels(&self, table: &FeatureTable) -> crate::Result<Vec<bool>> {
        let missing = |column: &str| PipelineError::MissingColumn {
            table: "feature table".to_string(),
            column: column.to_string(),
        };
        let delinquent = table
            .column("delinquent_cycles")
            .ok_or_else(|| missing("delinquent_cycles"))?;
        let utilization = table.column("utilization").ok_or_else(|| missing("utilization"))?;

        Ok((0..table.len())
            .map(|i| self.label(table.had_fraud[i], &table.statuses[i], delinquent[i], utilization[i]))
            .collect())
    }
}

/// Classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub rule: RiskRule,
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty on the weights (not the bias)
    pub l2: f64,
    /// Probability at or above which an account is flagged
    pub decision_threshold: f64,
    /// Precision or recall below this marks the evaluation degenerate
    pub degenerate_below: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            rule: RiskRule::default(),
            learning_rate: 0.1,
            epochs: 500,
            l2: 0.01,
            decision_threshold: 0.5,
            degenerate_below: 0.05,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.learning_rate > 0.0) || self.epochs == 0 || self.l2 < 0.0 {
            return Err(PipelineError::Config(
                "risk.learning_rate and risk.epochs must be positive, risk.l2 non-negative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(PipelineError::Config("risk.decision_threshold must lie in [0, 1]".into()));
        }
        Ok(())
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let exp_z = z.exp();
        exp_z / (1.0 + exp_z)
    }
}

/// Logistic regression on standardised features
#[derive(Debug)]
pub struct RiskClassifier {
    scaler: LinearScaler<f64>,
    pub weights: Array1<f64>,
    pub bias: f64,
}

impl RiskClassifier {
    /// Full-batch gradient descent on the class-weighted log loss
    pub fn fit(x: &Array2<f64>, y: &[bool], config: &RiskConfig) -> crate::Result<Self> {
        let n = x.nrows();
        let positives = y.iter().filter(|&&v| v).count();
        if n == 0 || n != y.len() {
            return Err(PipelineError::Model(format!("{} rows but {} labels", n, y.len())).into());
        }
        if positives == 0 || positives == n {
            return Err(PipelineError::Model("training partition contains a single class".into()).into());
        }

        let targets: Array1<usize> = y.iter().map(|&v| usize::from(v)).collect();
        let dataset = Dataset::new(x.clone(), targets);
        let scaler = LinearScaler::standard().fit(&dataset)?;
        let xs = standardise(&scaler, x);

        let pos_weight = n as f64 / (2.0 * positives as f64);
        let neg_weight = n as f64 / (2.0 * (n - positives) as f64);
        let sample_weight: Array1<f64> = y.iter().map(|&v| if v { pos_weight } else { neg_weight }).collect();
        let target: Array1<f64> = y.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect();
        let total_weight = sample_weight.sum();

        let mut weights = Array1::<f64>::zeros(xs.ncols());
        let mut bias = 0.0;
        for _ in 0..config.epochs {
            let predictions = (xs.dot(&weights) + bias).mapv(sigmoid);
            let errors = (&predictions - &target) * &sample_weight;

            let dw = xs.t().dot(&errors) / total_weight + &weights * config.l2;
            let db = errors.sum() / total_weight;

            weights = weights - dw * config.learning_rate;
            bias -= config.learning_rate * db;
        }

        log::debug!("Risk classifier weights: {:?}, bias {:.4}", weights.to_vec(), bias);
        Ok(Self { scaler, weights, bias })
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        (standardise(&self.scaler, x).dot(&self.weights) + self.bias).mapv(sigmoid)
    }
}

/// Zero-variance columns come out as zero rather than NaN
fn standardise(scaler: &LinearScaler<f64>, x: &Array2<f64>) -> Array2<f64> {
    scaler
        .transform(x.clone())
        .mapv(|v| if v.is_finite() { v } else { 0.0 })
}

/// Seeded split that keeps the class ratio in both partitions
pub fn stratified_split(labels: &[bool], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in [true, false] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);

        let n = members.len();
        let n_test = if n < 2 {
            0
        } else {
            ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1)
        };
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Probability, flag and rule label for one account
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskScore {
    pub probability: f64,
    /// Classifier decision at the configured threshold
    pub flagged: bool,
    /// Label produced by the [`RiskRule`]
    pub label: bool,
}

/// Evaluation report and per-account scores
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskModel {
    pub n_train: usize,
    pub n_test: usize,
    pub positive_rate: f64,
    pub report: ClassificationReport,
    #[serde(skip)]
    pub scores: BTreeMap<String, RiskScore>,
}

/// Fit the classifier on `train`, evaluate on its held-out part, score `score`
pub fn train_risk_model(
    train: &FeatureTable,
    score: &FeatureTable,
    config: &RiskConfig,
    test_fraction: f64,
    seed: u64,
) -> crate::Result<RiskModel> {
    config.validate()?;
    let labels = config.rule.labels(train)?;
    let positives = labels.iter().filter(|&&v| v).count();
    let positive_rate = if labels.is_empty() {
        0.0
    } else {
        positives as f64 / labels.len() as f64
    };
    log::info!("Risk labels: {} of {} accounts positive", positives, labels.len());

    let (train_idx, test_idx) = stratified_split(&labels, test_fraction, seed);
    let x = train.select(&RISK_FEATURES)?;
    let y_train: Vec<bool> = train_idx.iter().map(|&i| labels[i]).collect();
    let y_test: Vec<bool> = test_idx.iter().map(|&i| labels[i]).collect();

    let single_class = !y_train.is_empty() && y_train.iter().all(|&v| v == y_train[0]);
    let classifier = if single_class {
        log::warn!(
            "Risk labels contain a single class ({} of {} positive); classifier not fitted",
            positives,
            labels.len()
        );
        None
    } else {
        Some(RiskClassifier::fit(&x.select(Axis(0), &train_idx), &y_train, config)?)
    };
    let predict = |x: &Array2<f64>| match &classifier {
        Some(model) => model.predict_proba(x),
        None => Array1::from_elem(x.nrows(), positive_rate),
    };

    let predicted: Vec<bool> = predict(&x.select(Axis(0), &test_idx))
        .iter()
        .map(|&p| p >= config.decision_threshold)
        .collect();
    let mut report = ClassificationReport::compute(&y_test, &predicted, config.degenerate_below);
    report.degenerate |= single_class;

    log::info!(
        "Risk classifier: precision={:.3} recall={:.3} f1={:.3} on {} test rows",
        report.precision,
        report.recall,
        report.f1,
        test_idx.len()
    );
    if report.degenerate {
        log::warn!(
            "Risk classifier evaluation is degenerate ({} test positives, precision {:.3}, recall {:.3})",
            report.confusion.positives(),
            report.precision,
            report.recall
        );
    }

    let score_labels = config.rule.labels(score)?;
    let probabilities = predict(&score.select(&RISK_FEATURES)?);
    let scores = score
        .account_ids
        .iter()
        .zip(probabilities.iter())
        .zip(score_labels)
        .map(|((id, &probability), label)| {
            (
                id.clone(),
                RiskScore {
                    probability,
                    flagged: probability >= config.decision_threshold,
                    label,
                },
            )
        })
        .collect();

    Ok(RiskModel {
        n_train: train_idx.len(),
        n_test: test_idx.len(),
        positive_rate,
        report,
        scores,
    })
}
