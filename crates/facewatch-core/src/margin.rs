//! Multiclass probabilistic margin classifier over embeddings.
//!
//! A linear softmax model fitted with class-balanced, L2-regularized
//! full-batch gradient descent. Weights start at zero and the loop has no
//! randomness, so fitting the same data twice yields the same model.

use crate::types::Label;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`MarginModel::fit`] and the held-out check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginParams {
    pub epochs: usize,
    pub learning_rate: f32,
    pub l2: f32,
    /// Share of each class held out for the accuracy check.
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            epochs: 500,
            learning_rate: 0.5,
            l2: 1e-4,
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

/// Trained linear softmax classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginModel {
    labels: Vec<Label>,
    /// One row per class, `labels.len() x dim`.
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl MarginModel {
    pub fn from_parts(labels: Vec<Label>, weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Self {
        Self {
            labels,
            weights,
            bias,
        }
    }

    /// Fit on the given rows. Returns `None` when there is nothing to fit.
    pub fn fit(rows: &[&[f32]], labels: &[Label], params: &MarginParams) -> Option<Self> {
        let n = rows.len().min(labels.len());
        let dim = rows.first()?.len();
        if n == 0 || dim == 0 {
            return None;
        }

        let mut counts: BTreeMap<Label, usize> = BTreeMap::new();
        for &label in &labels[..n] {
            *counts.entry(label).or_default() += 1;
        }
        let classes: Vec<Label> = counts.keys().copied().collect();
        let k = classes.len();

        let x = Array2::from_shape_fn((n, dim), |(i, j)| rows[i].get(j).copied().unwrap_or(0.0));
        let mut targets = Array2::<f32>::zeros((n, k));
        let mut sample_weights = Array1::<f32>::zeros(n);
        for (i, label) in labels[..n].iter().enumerate() {
            let class = classes.partition_point(|c| c < label);
            targets[[i, class]] = 1.0;
            // Balanced weighting: n / (k * n_class).
            sample_weights[i] = n as f32 / (k as f32 * counts[label] as f32);
        }
        let total_weight = sample_weights.sum();
        let sample_weights = sample_weights.insert_axis(Axis(1));

        let mut w = Array2::<f32>::zeros((k, dim));
        let mut b = Array1::<f32>::zeros(k);

        for _ in 0..params.epochs {
            let mut probs = x.dot(&w.t()) + &b;
            softmax_rows(&mut probs);

            let mut grad = probs - &targets;
            grad *= &sample_weights;
            grad /= total_weight;

            let grad_w = grad.t().dot(&x) + &(&w * params.l2);
            let grad_b = grad.sum_axis(Axis(0));
            w.scaled_add(-params.learning_rate, &grad_w);
            b.scaled_add(-params.learning_rate, &grad_b);
        }

        Some(Self {
            labels: classes,
            weights: w.outer_iter().map(|row| row.to_vec()).collect(),
            bias: b.to_vec(),
        })
    }

    pub fn dim(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    /// Class labels in the order of [`predict_proba`](Self::predict_proba).
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Probability for each class in [`labels`](Self::labels) order.
    pub fn predict_proba(&self, x: &[f32]) -> Vec<f32> {
        let logits: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + b)
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        if total > 0.0 && total.is_finite() {
            exps.iter().map(|e| e / total).collect()
        } else {
            vec![1.0 / self.labels.len().max(1) as f32; self.labels.len()]
        }
    }

    /// Most probable label and its probability. The lower class index wins ties.
    pub fn predict(&self, x: &[f32]) -> Option<(Label, f32)> {
        let probs = self.predict_proba(x);
        let mut best: Option<(usize, f32)> = None;
        for (i, &p) in probs.iter().enumerate() {
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        best.map(|(i, p)| (self.labels[i], p))
    }

    /// Fraction of `indices` whose prediction matches its label.
    pub fn accuracy(&self, rows: &[Vec<f32>], labels: &[Label], indices: &[usize]) -> Option<f32> {
        self.evaluate(rows, labels, indices).map(|e| e.accuracy)
    }

    /// Accuracy plus per-label precision and recall over `indices`.
    pub fn evaluate(
        &self,
        rows: &[Vec<f32>],
        labels: &[Label],
        indices: &[usize],
    ) -> Option<Evaluation> {
        if indices.is_empty() {
            return None;
        }
        // (true positives, predicted as label, actually label)
        let mut tally: BTreeMap<Label, (usize, usize, usize)> = BTreeMap::new();
        let mut correct = 0;
        for &i in indices {
            let truth = labels[i];
            tally.entry(truth).or_default().2 += 1;
            if let Some((predicted, _)) = self.predict(&rows[i]) {
                tally.entry(predicted).or_default().1 += 1;
                if predicted == truth {
                    tally.entry(truth).or_default().0 += 1;
                    correct += 1;
                }
            }
        }
        let per_class = tally
            .into_iter()
            .map(|(label, (tp, predicted, support))| {
                let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f32 / d as f32 };
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                (
                    label,
                    ClassMetrics {
                        precision,
                        recall,
                        f1,
                        support,
                    },
                )
            })
            .collect();
        Some(Evaluation {
            accuracy: correct as f32 / indices.len() as f32,
            per_class,
        })
    }
}

/// Held-out scores for one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    /// Held-out rows carrying this label.
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub accuracy: f32,
    pub per_class: BTreeMap<Label, ClassMetrics>,
}

fn softmax_rows(logits: &mut Array2<f32>) {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        }
    }
}

/// Split row indices into `(train, test)` keeping class proportions.
///
/// Each class contributes `round(n * test_fraction)` rows to the test side,
/// but always keeps at least one row for training. Output indices are sorted.
pub fn stratified_split(labels: &[Label], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<Label, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::new();

    for (_, mut indices) in by_class {
        indices.shuffle(&mut rng);
        let n_test = ((indices.len() as f64) * test_fraction).round() as usize;
        let n_test = n_test.min(indices.len().saturating_sub(1));
        test.extend_from_slice(&indices[..n_test]);
        train.extend_from_slice(&indices[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}
