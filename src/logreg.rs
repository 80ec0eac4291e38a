//! Multinomial logistic regression solved with L-BFGS.
//!
//! Minimises `0.5 * ||W||^2 + C * sum_i CE(x_i, y_i)` over the weights `W`
//! `(nclasses, dim)` and an unpenalised intercept. Everything is computed in
//! `f64` and starts from zero, so a fit is fully deterministic.

use std::collections::VecDeque;

use tracing::debug;

use crate::classifier::{Classifier, Holdout};
use crate::metrics::argmax;
use crate::{Dataset, Error, Features, Result};

const HISTORY: usize = 10;
const GRAD_TOL: f64 = 1e-4;
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;
const CURVATURE_EPS: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    dim: usize,
    nclasses: usize,
    c: f64,
    max_iter: usize,
    /// `nclasses * dim` weights followed by `nclasses` intercepts.
    params: Vec<f64>,
    iterations: usize,
}

impl LogisticRegression {
    /// `c` is the inverse regularisation strength; larger means weaker L2.
    pub fn new(dim: usize, nclasses: usize, c: f64, max_iter: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("input dim must be > 0".to_owned()));
        }
        if nclasses < 2 {
            return Err(Error::InvalidConfig(format!(
                "nclasses must be >= 2, got {nclasses}"
            )));
        }
        if !(c.is_finite() && c > 0.0) {
            return Err(Error::InvalidConfig(format!("C must be finite and > 0, got {c}")));
        }
        if max_iter == 0 {
            return Err(Error::InvalidConfig("max_iter must be > 0".to_owned()));
        }
        Ok(Self {
            dim,
            nclasses,
            c,
            max_iter,
            params: vec![0.0; nclasses * dim + nclasses],
            iterations: 0,
        })
    }

    #[inline]
    pub fn c(&self) -> f64 {
        self.c
    }

    /// Solver iterations used by the last fit.
    #[inline]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Weights, row-major `(nclasses, dim)`.
    pub fn weights(&self) -> &[f64] {
        &self.params[..self.nclasses * self.dim]
    }

    pub fn intercepts(&self) -> &[f64] {
        &self.params[self.nclasses * self.dim..]
    }

    fn check_features(&self, features: &Features) -> Result<()> {
        if features.dim() != self.dim {
            return Err(Error::InvalidShape(format!(
                "feature dim {} does not match model input_dim {}",
                features.dim(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Write the logits of `row` under `params` into `out`.
    fn logits_into(&self, params: &[f64], row: &[f32], out: &mut [f64]) {
        let (weights, intercepts) = params.split_at(self.nclasses * self.dim);
        for ((o, w_row), &b) in out
            .iter_mut()
            .zip(weights.chunks_exact(self.dim))
            .zip(intercepts)
        {
            *o = b + w_row
                .iter()
                .zip(row)
                .map(|(&w, &x)| w * f64::from(x))
                .sum::<f64>();
        }
    }

    /// Objective value at `params`; the gradient is written into `grad`.
    fn objective(&self, params: &[f64], data: &Dataset, grad: &mut [f64]) -> f64 {
        let split = self.nclasses * self.dim;
        let weights = &params[..split];

        let mut value = 0.5 * weights.iter().map(|w| w * w).sum::<f64>();
        grad[..split].copy_from_slice(weights);
        grad[split..].iter_mut().for_each(|g| *g = 0.0);

        let mut probs = vec![0.0_f64; self.nclasses];
        for (idx, &label) in data.labels().iter().enumerate() {
            let row = data.features().row(idx);
            self.logits_into(params, row, &mut probs);
            let label_logit = probs[label];
            let log_z = softmax_in_place(&mut probs);
            value += self.c * (log_z - label_logit);

            for (class, &p) in probs.iter().enumerate() {
                let delta = self.c * (p - if class == label { 1.0 } else { 0.0 });
                let w_grad = &mut grad[class * self.dim..(class + 1) * self.dim];
                for (g, &x) in w_grad.iter_mut().zip(row) {
                    *g += delta * f64::from(x);
                }
                grad[split + class] += delta;
            }
        }
        value
    }
}

/// In-place softmax; returns the log-partition of the input logits.
fn softmax_in_place(values: &mut [f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
    max + sum.ln()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Curvature pair `(s, y, 1 / (y . s))`.
struct Pair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Two-loop recursion: returns `-H * grad` for the implicit inverse Hessian.
fn search_direction(grad: &[f64], history: &VecDeque<Pair>) -> Vec<f64> {
    let mut q = grad.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let alpha = pair.rho * dot(&pair.s, &q);
        q.iter_mut().zip(&pair.y).for_each(|(qi, yi)| *qi -= alpha * yi);
        alphas.push(alpha);
    }

    if let Some(last) = history.back() {
        let gamma = dot(&last.s, &last.y) / dot(&last.y, &last.y);
        q.iter_mut().for_each(|qi| *qi *= gamma);
    }

    for (pair, alpha) in history.iter().zip(alphas.into_iter().rev()) {
        let beta = pair.rho * dot(&pair.y, &q);
        q.iter_mut()
            .zip(&pair.s)
            .for_each(|(qi, si)| *qi += (alpha - beta) * si);
    }

    q.iter_mut().for_each(|qi| *qi = -*qi);
    q
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, data: &Dataset, _holdout: Holdout<'_>) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidData("train dataset must not be empty".to_owned()));
        }
        self.check_features(data.features())?;
        data.check_labels(self.nclasses)?;

        let n = self.params.len();
        let mut x = vec![0.0_f64; n];
        let mut grad = vec![0.0_f64; n];
        let mut value = self.objective(&x, data, &mut grad);

        let mut history: VecDeque<Pair> = VecDeque::with_capacity(HISTORY);
        let mut x_new = vec![0.0_f64; n];
        let mut grad_new = vec![0.0_f64; n];
        let mut iterations = 0;

        while iterations < self.max_iter && max_abs(&grad) > GRAD_TOL {
            let mut direction = search_direction(&grad, &history);
            let mut slope = dot(&grad, &direction);
            if slope.is_nan() || slope >= 0.0 {
                history.clear();
                direction = grad.iter().map(|g| -g).collect();
                slope = dot(&grad, &direction);
            }

            let mut step = if history.is_empty() {
                1.0 / dot(&grad, &grad).sqrt().max(1.0)
            } else {
                1.0
            };
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                for ((xn, &xi), &di) in x_new.iter_mut().zip(&x).zip(&direction) {
                    *xn = xi + step * di;
                }
                let candidate = self.objective(&x_new, data, &mut grad_new);
                if candidate.is_finite() && candidate <= value + ARMIJO_C1 * step * slope {
                    accepted = Some(candidate);
                    break;
                }
                step *= 0.5;
            }
            iterations += 1;

            let Some(candidate) = accepted else {
                debug!(iterations, value, "line search made no progress");
                break;
            };

            let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = grad_new.iter().zip(&grad).map(|(a, b)| a - b).collect();
            let sy = dot(&s, &y);
            if sy > CURVATURE_EPS {
                if history.len() == HISTORY {
                    history.pop_front();
                }
                history.push_back(Pair { s, y, rho: 1.0 / sy });
            }

            std::mem::swap(&mut x, &mut x_new);
            std::mem::swap(&mut grad, &mut grad_new);
            value = candidate;
        }

        if !value.is_finite() {
            return Err(Error::Diverged(format!("logistic regression objective is {value}")));
        }
        debug!(
            c = self.c,
            iterations,
            value,
            grad_max = max_abs(&grad),
            "logistic regression solved"
        );
        self.params = x;
        self.iterations = iterations;
        Ok(())
    }

    fn predict(&self, features: &Features) -> Result<Vec<usize>> {
        self.check_features(features)?;
        let mut logits = vec![0.0_f64; self.nclasses];
        Ok((0..features.len())
            .map(|idx| {
                self.logits_into(&self.params, features.row(idx), &mut logits);
                argmax(&logits).unwrap_or(0)
            })
            .collect())
    }

    fn predict_proba(&self, features: &Features) -> Result<Vec<f32>> {
        self.check_features(features)?;
        let mut probas = Vec::with_capacity(features.len() * self.nclasses);
        let mut logits = vec![0.0_f64; self.nclasses];
        for idx in 0..features.len() {
            self.logits_into(&self.params, features.row(idx), &mut logits);
            softmax_in_place(&mut logits);
            probas.extend(logits.iter().map(|&p| p as f32));
        }
        Ok(probas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_bands() -> Dataset {
        // Three classes placed along one axis plus a nuisance feature.
        let rows = vec![
            vec![-2.0, 0.3],
            vec![-1.8, -0.2],
            vec![-2.2, 0.1],
            vec![0.0, 0.2],
            vec![0.1, -0.3],
            vec![-0.1, 0.0],
            vec![2.0, 0.1],
            vec![1.9, -0.1],
            vec![2.1, 0.2],
        ];
        Dataset::from_rows(&rows, &[0, 0, 0, 1, 1, 1, 2, 2, 2]).unwrap()
    }

    #[test]
    fn objective_gradient_matches_finite_differences() {
        let data = three_bands();
        let model = LogisticRegression::new(2, 3, 0.7, 10).unwrap();
        let params: Vec<f64> = (0..model.params.len()).map(|i| 0.1 * i as f64 - 0.4).collect();

        let mut grad = vec![0.0; params.len()];
        model.objective(&params, &data, &mut grad);

        let eps = 1e-6;
        let mut scratch = vec![0.0; params.len()];
        for i in 0..params.len() {
            let mut plus = params.clone();
            plus[i] += eps;
            let mut minus = params.clone();
            minus[i] -= eps;
            let numeric = (model.objective(&plus, &data, &mut scratch)
                - model.objective(&minus, &data, &mut scratch))
                / (2.0 * eps);
            assert!(
                (numeric - grad[i]).abs() < 1e-5,
                "param {i}: analytic {} numeric {numeric}",
                grad[i]
            );
        }
    }

    #[test]
    fn fits_separable_classes() {
        let data = three_bands();
        let mut model = LogisticRegression::new(2, 3, 10.0, 100).unwrap();
        model.fit(&data, Holdout::Split(0.1)).unwrap();
        assert_eq!(model.score(&data).unwrap(), 1.0);
        assert!(model.iterations() > 0);

        let probas = model.predict_proba(data.features()).unwrap();
        assert_eq!(probas.len(), 9 * 3);
        for row in probas.chunks_exact(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn fit_is_deterministic() {
        let data = three_bands();
        let mut a = LogisticRegression::new(2, 3, 1.0, 50).unwrap();
        let mut b = a.clone();
        a.fit(&data, Holdout::Split(0.1)).unwrap();
        b.fit(&data, Holdout::Split(0.1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stronger_regularisation_shrinks_weights() {
        let data = three_bands();
        let mut weak = LogisticRegression::new(2, 3, 8.0, 100).unwrap();
        let mut strong = LogisticRegression::new(2, 3, 0.25, 100).unwrap();
        weak.fit(&data, Holdout::Split(0.1)).unwrap();
        strong.fit(&data, Holdout::Split(0.1)).unwrap();
        assert!(max_abs(strong.weights()) < max_abs(weak.weights()));
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(LogisticRegression::new(2, 1, 1.0, 10).is_err());
        assert!(LogisticRegression::new(2, 2, 0.0, 10).is_err());
        let model = LogisticRegression::new(3, 3, 1.0, 10).unwrap();
        assert!(matches!(
            model.predict(three_bands().features()),
            Err(Error::InvalidShape(_))
        ));
    }
}
