//! Fully-connected layer with batched kernels.

use rand::Rng;
use rand::distributions::{Distribution, Uniform};

use crate::matmul::{MatRef, gemm};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    in_dim: usize,
    out_dim: usize,
    /// Row-major matrix with shape (out_dim, in_dim).
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl Layer {
    /// Create a layer with weights and biases drawn from `U(-1/sqrt(in_dim), 1/sqrt(in_dim))`.
    pub fn new_with_rng<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "layer dims must be > 0, got in_dim={in_dim} out_dim={out_dim}"
            )));
        }

        let bound = 1.0 / (in_dim as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weights = (0..in_dim * out_dim).map(|_| dist.sample(rng)).collect();
        let biases = (0..out_dim).map(|_| dist.sample(rng)).collect();

        Ok(Self {
            in_dim,
            out_dim,
            weights,
            biases,
        })
    }

    /// Build a layer from explicit parameters.
    pub fn from_parts(
        in_dim: usize,
        out_dim: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidShape(format!(
                "layer dims must be > 0, got in_dim={in_dim} out_dim={out_dim}"
            )));
        }
        if weights.len() != in_dim * out_dim {
            return Err(Error::InvalidShape(format!(
                "weights length {} does not match out_dim * in_dim ({out_dim} * {in_dim})",
                weights.len()
            )));
        }
        if biases.len() != out_dim {
            return Err(Error::InvalidShape(format!(
                "biases length {} does not match out_dim {out_dim}",
                biases.len()
            )));
        }
        Ok(Self {
            in_dim,
            out_dim,
            weights,
            biases,
        })
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[inline]
    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    #[inline]
    pub(crate) fn params_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.weights, &mut self.biases)
    }

    /// Batched forward pass: `outputs = inputs * W^T + b`.
    ///
    /// Shape contract:
    /// - `inputs.len() == batch * in_dim`
    /// - `outputs.len() == batch * out_dim`
    pub fn forward_batch(&self, inputs: &[f32], batch: usize, outputs: &mut [f32]) {
        assert_eq!(inputs.len(), batch * self.in_dim, "layer input shape mismatch");
        assert_eq!(outputs.len(), batch * self.out_dim, "layer output shape mismatch");
        if batch == 0 {
            return;
        }

        for row in outputs.chunks_exact_mut(self.out_dim) {
            row.copy_from_slice(&self.biases);
        }
        gemm(
            batch,
            self.out_dim,
            self.in_dim,
            1.0,
            MatRef::rows(inputs, self.in_dim),
            MatRef::transposed(&self.weights, self.in_dim),
            1.0,
            outputs,
        );
    }

    /// Batched backward pass (overwrite semantics).
    ///
    /// - `d_weights = d_outputs^T * inputs`
    /// - `d_biases = column sums of d_outputs`
    /// - `d_inputs = d_outputs * W` (skipped when `None`, e.g. for the first layer)
    ///
    /// `d_outputs` is the gradient w.r.t. the pre-activation outputs.
    pub fn backward_batch(
        &self,
        inputs: &[f32],
        d_outputs: &[f32],
        batch: usize,
        d_weights: &mut [f32],
        d_biases: &mut [f32],
        d_inputs: Option<&mut [f32]>,
    ) {
        assert_eq!(inputs.len(), batch * self.in_dim, "layer input shape mismatch");
        assert_eq!(d_outputs.len(), batch * self.out_dim, "layer d_output shape mismatch");
        assert_eq!(d_weights.len(), self.weights.len(), "d_weights shape mismatch");
        assert_eq!(d_biases.len(), self.out_dim, "d_biases shape mismatch");

        d_weights.fill(0.0);
        d_biases.fill(0.0);
        if batch == 0 {
            return;
        }

        gemm(
            self.out_dim,
            self.in_dim,
            batch,
            1.0,
            MatRef::transposed(d_outputs, self.out_dim),
            MatRef::rows(inputs, self.in_dim),
            0.0,
            d_weights,
        );

        for row in d_outputs.chunks_exact(self.out_dim) {
            for (db, &g) in d_biases.iter_mut().zip(row) {
                *db += g;
            }
        }

        if let Some(d_inputs) = d_inputs {
            assert_eq!(d_inputs.len(), batch * self.in_dim, "d_inputs shape mismatch");
            gemm(
                batch,
                self.in_dim,
                self.out_dim,
                1.0,
                MatRef::rows(d_outputs, self.out_dim),
                MatRef::rows(&self.weights, self.in_dim),
                0.0,
                d_inputs,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn init_respects_fan_in_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Layer::new_with_rng(16, 4, &mut rng).unwrap();
        let bound = 0.25 + 1e-6;
        assert!(layer.weights().iter().all(|w| w.abs() <= bound));
        assert!(layer.biases().iter().all(|b| b.abs() <= bound));
    }

    #[test]
    fn forward_batch_matches_manual_product() {
        let layer = Layer::from_parts(2, 2, vec![1.0, 2.0, 3.0, 4.0], vec![0.5, -0.5]).unwrap();
        let inputs = [1.0_f32, 1.0, 2.0, 0.0];
        let mut out = [0.0_f32; 4];
        layer.forward_batch(&inputs, 2, &mut out);
        assert_eq!(out, [3.5, 6.5, 2.5, 5.5]);
    }

    #[test]
    fn backward_batch_sums_over_rows() {
        let layer = Layer::from_parts(2, 1, vec![2.0, -1.0], vec![0.0]).unwrap();
        let inputs = [1.0_f32, 2.0, 3.0, 4.0];
        let d_out = [1.0_f32, 0.5];
        let mut dw = [0.0_f32; 2];
        let mut db = [0.0_f32; 1];
        let mut dx = [0.0_f32; 4];
        layer.backward_batch(&inputs, &d_out, 2, &mut dw, &mut db, Some(&mut dx));
        assert_eq!(dw, [2.5, 4.0]);
        assert_eq!(db, [1.5]);
        assert_eq!(dx, [2.0, -1.0, 1.0, -0.5]);
    }

    #[test]
    fn from_parts_rejects_bad_lengths() {
        assert!(Layer::from_parts(2, 2, vec![0.0; 3], vec![0.0; 2]).is_err());
        assert!(Layer::from_parts(2, 2, vec![0.0; 4], vec![0.0; 1]).is_err());
    }
}
