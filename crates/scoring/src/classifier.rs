//! Binary logistic regression over standardised features.
//!
//! Deterministic: zero-initialised weights, full-batch gradient descent, no
//! random sampling.

use serde::{Deserialize, Serialize};

/// Hyper-parameters for [`LogisticModel::fit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    pub epochs: usize,
    pub learning_rate: f64,
    /// L2 penalty on the weights (not the bias).
    pub l2: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            epochs: 400,
            learning_rate: 0.1,
            l2: 0.01,
        }
    }
}

/// Fitted parameters. This is what a model artifact stores as its opaque blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl LogisticModel {
    /// Fit with class-balanced sample weights.
    ///
    /// `samples` must be non-empty and rectangular; `labels` parallel to it.
    pub fn fit(samples: &[Vec<f64>], labels: &[bool], params: &FitParams) -> Self {
        let n = samples.len();
        let dim = samples.first().map_or(0, Vec::len);
        let (means, scales) = standardisation(samples, dim);

        let standardised: Vec<Vec<f64>> = samples
            .iter()
            .map(|x| standardise(x, &means, &scales))
            .collect();

        let positives = labels.iter().filter(|l| **l).count();
        let negatives = n - positives;
        let class_weight = |label: bool| {
            let count = if label { positives } else { negatives };
            if count == 0 {
                0.0
            } else {
                n as f64 / (2.0 * count as f64)
            }
        };

        let mut weights = vec![0.0; dim];
        let mut bias = 0.0;
        let n_f = n.max(1) as f64;

        for _ in 0..params.epochs {
            let mut grad_w = vec![0.0; dim];
            let mut grad_b = 0.0;

            for (x, &y) in standardised.iter().zip(labels) {
                let p = sigmoid(dot(&weights, x) + bias);
                let err = (p - if y { 1.0 } else { 0.0 }) * class_weight(y);
                for (g, xi) in grad_w.iter_mut().zip(x) {
                    *g += err * xi;
                }
                grad_b += err;
            }

            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= params.learning_rate * (g / n_f + params.l2 * *w);
            }
            bias -= params.learning_rate * grad_b / n_f;
        }

        Self {
            weights,
            bias,
            means,
            scales,
        }
    }

    pub fn dimension(&self) -> usize {
        self.weights.len()
    }

    /// Parameters are internally consistent and finite.
    pub fn is_well_formed(&self) -> bool {
        let dim = self.weights.len();
        self.means.len() == dim
            && self.scales.len() == dim
            && self.bias.is_finite()
            && self.weights.iter().all(|w| w.is_finite())
            && self.means.iter().all(|m| m.is_finite())
            && self.scales.iter().all(|s| s.is_finite() && *s > 0.0)
    }

    /// Probability of the positive class (conversion).
    pub fn predict_proba(&self, x: &[f64]) -> f64 {
        let z = standardise(x, &self.means, &self.scales);
        sigmoid(dot(&self.weights, &z) + self.bias)
    }
}

/// Evaluation metrics at a 0.5 decision threshold.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl BinaryMetrics {
    pub fn evaluate(model: &LogisticModel, samples: &[Vec<f64>], labels: &[bool]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let (mut tp, mut fp, mut tn, mut fn_) = (0u32, 0u32, 0u32, 0u32);
        for (x, &y) in samples.iter().zip(labels) {
            let predicted = model.predict_proba(x) >= 0.5;
            match (predicted, y) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let total = (tp + fp + tn + fn_) as f64;
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            accuracy: (tp + tn) as f64 / total,
            precision,
            recall,
            f1,
        }
    }
}

fn ratio(num: u32, den: u32) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn standardisation(samples: &[Vec<f64>], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let n = samples.len().max(1) as f64;
    let mut means = vec![0.0; dim];
    for x in samples {
        for (m, v) in means.iter_mut().zip(x) {
            *m += v;
        }
    }
    for m in &mut means {
        *m /= n;
    }

    let mut scales = vec![0.0; dim];
    for x in samples {
        for ((s, v), m) in scales.iter_mut().zip(x).zip(&means) {
            *s += (v - m) * (v - m);
        }
    }
    for s in &mut scales {
        let std = (*s / n).sqrt();
        // Constant columns carry no signal; keep them at zero instead of dividing by 0.
        *s = if std > f64::EPSILON { std } else { 1.0 };
    }
    (means, scales)
}

fn standardise(x: &[f64], means: &[f64], scales: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(means)
        .zip(scales)
        .map(|((v, m), s)| (v - m) / s)
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
