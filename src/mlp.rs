//! The probe network.
//!
//! Two shapes are supported:
//!
//! - `nhid == 0`: one dense layer `input -> classes` (multinomial logistic
//!   regression trained by gradient descent).
//! - `nhid > 0`: `input -> hidden`, dropout, sigmoid, `hidden -> classes`.
//!
//! Forward/backward run on whole mini-batches through the GEMM kernels and reuse
//! `BatchScratch` / `Gradients` buffers sized for the largest batch.

use rand::Rng;
use rand::rngs::StdRng;

use crate::activation::Activation;
use crate::{Error, Layer, Result};

const HIDDEN_ACTIVATION: Activation = Activation::Sigmoid;

#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    layers: Vec<Layer>,
    dropout: f32,
}

/// Reusable forward buffers for up to `capacity` rows.
///
/// The logits of the most recent forward pass live inside the scratch.
#[derive(Debug, Clone)]
pub struct BatchScratch {
    capacity: usize,
    rows: usize,
    // Post-sigmoid hidden activations (empty without a hidden layer).
    hidden: Vec<f32>,
    // Inverted-dropout multipliers: 0 or 1/(1-p).
    mask: Vec<f32>,
    mask_active: bool,
    logits: Vec<f32>,
}

/// Parameter gradients for an `Mlp` (overwrite semantics).
#[derive(Debug, Clone)]
pub struct Gradients {
    d_weights: Vec<Vec<f32>>,
    d_biases: Vec<Vec<f32>>,
    d_hidden: Vec<f32>,
    d_logits: Vec<f32>,
}

impl Mlp {
    /// Build a freshly initialised network.
    pub fn new_with_rng<R: Rng + ?Sized>(
        input_dim: usize,
        nhid: usize,
        nclasses: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let layers = if nhid == 0 {
            vec![Layer::new_with_rng(input_dim, nclasses, rng)?]
        } else {
            let hidden = Layer::new_with_rng(input_dim, nhid, rng)?;
            let output = Layer::new_with_rng(nhid, nclasses, rng)?;
            vec![hidden, output]
        };
        Self::from_layers(layers, dropout)
    }

    /// Assemble a network from explicit layers (one or two).
    pub fn from_layers(layers: Vec<Layer>, dropout: f32) -> Result<Self> {
        if layers.is_empty() || layers.len() > 2 {
            return Err(Error::InvalidConfig(format!(
                "probe network has 1 or 2 layers, got {}",
                layers.len()
            )));
        }
        if layers.len() == 2 && layers[0].out_dim() != layers[1].in_dim() {
            return Err(Error::InvalidShape(format!(
                "hidden out_dim {} does not match output in_dim {}",
                layers[0].out_dim(),
                layers[1].in_dim()
            )));
        }
        if !(dropout.is_finite() && (0.0..1.0).contains(&dropout)) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0,1), got {dropout}"
            )));
        }
        Ok(Self { layers, dropout })
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.layers[0].in_dim()
    }

    #[inline]
    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].out_dim()
    }

    /// Hidden width, or 0 for the linear model.
    #[inline]
    pub fn hidden_dim(&self) -> usize {
        if self.layers.len() == 2 {
            self.layers[0].out_dim()
        } else {
            0
        }
    }

    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    #[inline]
    pub(crate) fn layer_mut(&mut self, idx: usize) -> &mut Layer {
        &mut self.layers[idx]
    }

    #[inline]
    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    pub fn scratch(&self, capacity: usize) -> BatchScratch {
        BatchScratch::new(self, capacity)
    }

    pub fn gradients(&self, capacity: usize) -> Gradients {
        Gradients::new(self, capacity)
    }

    /// Inference forward pass over `batch` rows (dropout disabled).
    ///
    /// Returns the logits with shape `(batch, output_dim)`.
    pub fn forward_batch<'a>(
        &self,
        inputs: &[f32],
        batch: usize,
        scratch: &'a mut BatchScratch,
    ) -> &'a [f32] {
        self.forward_impl(inputs, batch, scratch, None)
    }

    /// Training forward pass: like [`Mlp::forward_batch`] but samples a fresh
    /// dropout mask from `rng` when dropout is configured.
    pub fn forward_batch_train<'a>(
        &self,
        inputs: &[f32],
        batch: usize,
        scratch: &'a mut BatchScratch,
        rng: &mut StdRng,
    ) -> &'a [f32] {
        self.forward_impl(inputs, batch, scratch, Some(rng))
    }

    fn forward_impl<'a>(
        &self,
        inputs: &[f32],
        batch: usize,
        scratch: &'a mut BatchScratch,
        rng: Option<&mut StdRng>,
    ) -> &'a [f32] {
        assert!(
            batch <= scratch.capacity,
            "batch {batch} exceeds scratch capacity {}",
            scratch.capacity
        );
        assert_eq!(
            inputs.len(),
            batch * self.input_dim(),
            "inputs len {} does not match batch * input_dim ({batch} * {})",
            inputs.len(),
            self.input_dim()
        );

        scratch.rows = batch;
        let logits = &mut scratch.logits[..batch * self.output_dim()];

        match self.layers.as_slice() {
            [linear] => {
                scratch.mask_active = false;
                linear.forward_batch(inputs, batch, logits);
            }
            [hidden, output] => {
                let h = &mut scratch.hidden[..batch * hidden.out_dim()];
                hidden.forward_batch(inputs, batch, h);

                scratch.mask_active = false;
                if let Some(rng) = rng
                    && self.dropout > 0.0
                {
                    let keep_scale = 1.0 / (1.0 - self.dropout);
                    let mask = &mut scratch.mask[..h.len()];
                    for (v, m) in h.iter_mut().zip(mask.iter_mut()) {
                        *m = if rng.gen_bool(f64::from(self.dropout)) {
                            0.0
                        } else {
                            keep_scale
                        };
                        *v *= *m;
                    }
                    scratch.mask_active = true;
                }

                HIDDEN_ACTIVATION.apply(h);
                output.forward_batch(h, batch, logits);
            }
            _ => unreachable!("Mlp always has one or two layers"),
        }

        &scratch.logits[..batch * self.output_dim()]
    }

    /// Backward pass for the most recent forward over `inputs`.
    ///
    /// Before calling this, write `dL/d(logits)` into
    /// [`Gradients::d_logits_mut`] for the same batch size.
    pub fn backward_batch(&self, inputs: &[f32], scratch: &BatchScratch, grads: &mut Gradients) {
        let batch = scratch.rows;
        assert_eq!(
            inputs.len(),
            batch * self.input_dim(),
            "inputs len {} does not match batch * input_dim ({batch} * {})",
            inputs.len(),
            self.input_dim()
        );
        assert_eq!(
            grads.d_weights.len(),
            self.layers.len(),
            "grads were built for a different model"
        );

        let d_logits = &grads.d_logits[..batch * self.output_dim()];

        match self.layers.as_slice() {
            [linear] => {
                linear.backward_batch(
                    inputs,
                    d_logits,
                    batch,
                    &mut grads.d_weights[0],
                    &mut grads.d_biases[0],
                    None,
                );
            }
            [hidden, output] => {
                let n_hidden = batch * hidden.out_dim();
                let h = &scratch.hidden[..n_hidden];
                let d_h = &mut grads.d_hidden[..n_hidden];
                output.backward_batch(
                    h,
                    d_logits,
                    batch,
                    &mut grads.d_weights[1],
                    &mut grads.d_biases[1],
                    Some(d_h),
                );

                let d_h = &mut grads.d_hidden[..n_hidden];
                HIDDEN_ACTIVATION.backprop(h, d_h);
                if scratch.mask_active {
                    for (d, &m) in d_h.iter_mut().zip(&scratch.mask[..n_hidden]) {
                        *d *= m;
                    }
                }

                hidden.backward_batch(
                    inputs,
                    d_h,
                    batch,
                    &mut grads.d_weights[0],
                    &mut grads.d_biases[0],
                    None,
                );
            }
            _ => unreachable!("Mlp always has one or two layers"),
        }
    }
}

impl BatchScratch {
    pub fn new(mlp: &Mlp, capacity: usize) -> Self {
        let hidden_len = capacity * mlp.hidden_dim();
        Self {
            capacity,
            rows: 0,
            hidden: vec![0.0; hidden_len],
            mask: vec![0.0; hidden_len],
            mask_active: false,
            logits: vec![0.0; capacity * mlp.output_dim()],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Gradients {
    pub fn new(mlp: &Mlp, capacity: usize) -> Self {
        let mut d_weights = Vec::with_capacity(mlp.layers.len());
        let mut d_biases = Vec::with_capacity(mlp.layers.len());
        for layer in &mlp.layers {
            d_weights.push(vec![0.0; layer.in_dim() * layer.out_dim()]);
            d_biases.push(vec![0.0; layer.out_dim()]);
        }

        Self {
            d_weights,
            d_biases,
            d_hidden: vec![0.0; capacity * mlp.hidden_dim()],
            d_logits: vec![0.0; capacity * mlp.output_dim()],
        }
    }

    /// Upstream gradient buffer for the logits of a `batch`-row forward pass.
    #[inline]
    pub fn d_logits_mut(&mut self, batch: usize, nclasses: usize) -> &mut [f32] {
        &mut self.d_logits[..batch * nclasses]
    }

    #[inline]
    pub fn d_weights(&self, layer_idx: usize) -> &[f32] {
        &self.d_weights[layer_idx]
    }

    #[inline]
    pub fn d_biases(&self, layer_idx: usize) -> &[f32] {
        &self.d_biases[layer_idx]
    }

    #[inline]
    pub fn d_weights_mut(&mut self, layer_idx: usize) -> &mut [f32] {
        &mut self.d_weights[layer_idx]
    }

    #[inline]
    pub fn d_biases_mut(&mut self, layer_idx: usize) -> &mut [f32] {
        &mut self.d_biases[layer_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    use crate::loss;

    fn loss_for_mlp(mlp: &Mlp, inputs: &[f32], labels: &[usize]) -> f32 {
        let mut scratch = mlp.scratch(labels.len());
        let logits = mlp.forward_batch(inputs, labels.len(), &mut scratch);
        loss::cross_entropy_sum(logits, labels, mlp.output_dim())
    }

    fn assert_close(analytic: f32, numeric: f32, abs_tol: f32, rel_tol: f32) {
        let diff = (analytic - numeric).abs();
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        assert!(
            diff <= abs_tol || diff / scale <= rel_tol,
            "analytic={analytic} numeric={numeric} diff={diff}"
        );
    }

    #[test]
    fn seeded_init_is_deterministic() {
        let a = Mlp::new_with_rng(3, 4, 2, 0.0, &mut StdRng::seed_from_u64(123)).unwrap();
        let b = Mlp::new_with_rng(3, 4, 2, 0.0, &mut StdRng::seed_from_u64(123)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn backward_matches_numeric_gradients() {
        let mut rng = StdRng::seed_from_u64(0);
        for nhid in [0, 3] {
            let mut mlp = Mlp::new_with_rng(2, nhid, 3, 0.0, &mut rng).unwrap();
            let inputs = [0.3_f32, -0.7, 1.1, 0.4];
            let labels = [2_usize, 0];

            let mut scratch = mlp.scratch(2);
            let mut grads = mlp.gradients(2);
            let logits = mlp.forward_batch(&inputs, 2, &mut scratch);
            loss::cross_entropy_sum_backward(logits, &labels, 3, grads.d_logits_mut(2, 3));
            mlp.backward_batch(&inputs, &scratch, &mut grads);

            let eps = 1e-3_f32;
            for layer_idx in 0..mlp.num_layers() {
                let n_w = mlp.layers()[layer_idx].weights().len();
                let n_b = mlp.layers()[layer_idx].biases().len();
                for (is_bias, len) in [(false, n_w), (true, n_b)] {
                    for p in 0..len {
                        let nudge = |mlp: &mut Mlp, delta: f32| {
                            let (w, b) = mlp.layer_mut(layer_idx).params_mut();
                            if is_bias {
                                b[p] += delta;
                            } else {
                                w[p] += delta;
                            }
                        };
                        nudge(&mut mlp, eps);
                        let plus = loss_for_mlp(&mlp, &inputs, &labels);
                        nudge(&mut mlp, -2.0 * eps);
                        let minus = loss_for_mlp(&mlp, &inputs, &labels);
                        nudge(&mut mlp, eps);

                        let numeric = (plus - minus) / (2.0 * eps);
                        let analytic = if is_bias {
                            grads.d_biases(layer_idx)[p]
                        } else {
                            grads.d_weights(layer_idx)[p]
                        };
                        assert_close(analytic, numeric, 2e-3, 1e-2);
                    }
                }
            }
        }
    }

    #[test]
    fn dropout_only_applies_in_training() {
        let mut rng = StdRng::seed_from_u64(5);
        let mlp = Mlp::new_with_rng(4, 8, 2, 0.5, &mut rng).unwrap();
        let inputs = [0.5_f32, -0.5, 1.0, 2.0];

        let mut scratch = mlp.scratch(1);
        let eval_a = mlp.forward_batch(&inputs, 1, &mut scratch).to_vec();
        let eval_b = mlp.forward_batch(&inputs, 1, &mut scratch).to_vec();
        assert_eq!(eval_a, eval_b);

        let mut drop_rng = StdRng::seed_from_u64(9);
        mlp.forward_batch_train(&inputs, 1, &mut scratch, &mut drop_rng);
        assert!(scratch.mask_active);
        assert!(scratch.mask[..8].iter().all(|&m| m == 0.0 || m == 2.0));
    }

    #[test]
    fn clone_is_independent_of_later_updates() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut live = Mlp::new_with_rng(2, 0, 2, 0.0, &mut rng).unwrap();
        let snapshot = live.clone();
        live.layer_mut(0).params_mut().0[0] += 1.0;
        assert_ne!(live, snapshot);
        assert_eq!(
            snapshot.layers()[0].weights()[0] + 1.0,
            live.layers()[0].weights()[0]
        );
    }

    #[test]
    fn rejects_bad_dropout() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Mlp::new_with_rng(2, 2, 2, 1.0, &mut rng).is_err());
        assert!(Mlp::new_with_rng(2, 2, 2, -0.1, &mut rng).is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn forward_panics_on_input_shape_mismatch() {
        let mlp = Mlp::new_with_rng(2, 0, 2, 0.0, &mut StdRng::seed_from_u64(0)).unwrap();
        let mut scratch = mlp.scratch(1);
        mlp.forward_batch(&[0.0; 3], 1, &mut scratch);
    }
}
