//! Element-wise activations over batch buffers.
//!
//! Only the hidden layer of the probe is activated (sigmoid); logits are left
//! as they are. Backprop works from the cached post-activation values, so the
//! pre-activations never need to be stored.

/// Activation applied to a hidden layer. Logits stay linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
}

impl Activation {
    /// Activate `values` in place.
    pub(crate) fn apply(self, values: &mut [f32]) {
        match self {
            Activation::Sigmoid => values.iter_mut().for_each(|v| *v = sigmoid(*v)),
        }
    }

    /// Turn `dL/dy` into `dL/dz` in place, given the activated outputs `y`.
    pub(crate) fn backprop(self, outputs: &[f32], grads: &mut [f32]) {
        debug_assert_eq!(outputs.len(), grads.len());
        match self {
            Activation::Sigmoid => {
                for (g, &y) in grads.iter_mut().zip(outputs) {
                    *g *= y * (1.0 - y);
                }
            }
        }
    }
}

/// Logistic function without overflow for large `|x|`.
#[inline]
fn sigmoid(x: f32) -> f32 {
    let e = (-x.abs()).exp();
    if x >= 0.0 { 1.0 / (1.0 + e) } else { e / (1.0 + e) }
}
