//! Regression and binary classification metrics

use serde::Serialize;

/// Held-out regression error
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub n: usize,
}

impl RegressionMetrics {
    pub fn compute(actual: &[f64], predicted: &[f64]) -> Self {
        let n = actual.len().min(predicted.len());
        if n == 0 {
            return Self {
                rmse: 0.0,
                mae: 0.0,
                n: 0,
            };
        }

        let (sq, abs) = actual
            .iter()
            .zip(predicted)
            .fold((0.0, 0.0), |(sq, abs), (a, p)| {
                let err = a - p;
                (sq + err * err, abs + err.abs())
            });

        Self {
            rmse: (sq / n as f64).sqrt(),
            mae: abs / n as f64,
            n,
        }
    }
}

/// Confusion counts with the positive class being `true`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn from_labels(actual: &[bool], predicted: &[bool]) -> Self {
        let mut cm = Self::default();
        for (&a, &p) in actual.iter().zip(predicted) {
            match (a, p) {
                (true, true) => cm.tp += 1,
                (false, true) => cm.fp += 1,
                (false, false) => cm.tn += 1,
                (true, false) => cm.fn_ += 1,
            }
        }
        cm
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn positives(&self) -> usize {
        self.tp + self.fn_
    }
}

/// Precision, recall and F1 on the positive class
///
/// Accuracy is kept for reference only; with a rare positive class it is
/// high even for a classifier that never fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub confusion: ConfusionMatrix,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub degenerate: bool,
}

impl ClassificationReport {
    /// Score predictions, flagging degeneracy below `floor`
    pub fn compute(actual: &[bool], predicted: &[bool], floor: f64) -> Self {
        let confusion = ConfusionMatrix::from_labels(actual, predicted);
        let precision = ratio(confusion.tp, confusion.tp + confusion.fp);
        let recall = ratio(confusion.tp, confusion.tp + confusion.fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let accuracy = ratio(confusion.tp + confusion.tn, confusion.total());
        let degenerate = confusion.positives() == 0 || precision < floor || recall < floor;

        Self {
            confusion,
            precision,
            recall,
            f1,
            accuracy,
            degenerate,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_regression_metrics() {
        let m = RegressionMetrics::compute(&[1.0, 2.0, 3.0, 4.0], &[2.0, 2.0, 3.0, 1.0]);
        assert_relative_eq!(m.mae, 1.0);
        assert_relative_eq!(m.rmse, (10.0f64 / 4.0).sqrt());
        assert_eq!(m.n, 4);
    }

    #[test]
    fn test_classification_report() {
        let actual = [true, true, false, false, false, true];
        let predicted = [true, false, true, false, false, true];
        let r = ClassificationReport::compute(&actual, &predicted, 0.05);

        assert_eq!(r.confusion, ConfusionMatrix { tp: 2, fp: 1, tn: 2, fn_: 1 });
        assert_relative_eq!(r.precision, 2.0 / 3.0);
        assert_relative_eq!(r.recall, 2.0 / 3.0);
        assert_relative_eq!(r.f1, 2.0 / 3.0);
        assert!(!r.degenerate);
    }

    #[test]
    fn test_never_firing_classifier_is_degenerate() {
        let actual = [false, false, false, false, false, false, false, false, false, true];
        let predicted = [false; 10];
        let r = ClassificationReport::compute(&actual, &predicted, 0.05);

        assert_relative_eq!(r.accuracy, 0.9);
        assert_eq!(r.recall, 0.0);
        assert!(r.degenerate);
    }
}
