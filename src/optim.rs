//! Optimizers.
//!
//! An [`Optimizer`] is a validated set of hyperparameters, usually resolved from a
//! string such as `"adam"` or `"sgd,lr=0.1,momentum=0.9"`. Calling
//! [`Optimizer::state`] allocates the per-parameter buffers (momentum, moments,
//! accumulators) that live outside the model and are reused across steps.
//!
//! Weight decay is the coupled L2 form: `g += weight_decay * p` is applied to
//! every parameter (biases included) before the update rule.

use std::str::FromStr;

use crate::{Error, Gradients, Mlp, Result};

/// Update rule and its rule-specific hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerKind {
    Sgd {
        momentum: f32,
        dampening: f32,
        nesterov: bool,
    },
    /// Adam (bias-corrected).
    Adam { beta1: f32, beta2: f32, eps: f32 },
    /// Adam with the infinity norm.
    Adamax { beta1: f32, beta2: f32, eps: f32 },
    RmsProp { alpha: f32, eps: f32, momentum: f32 },
    Adagrad { lr_decay: f32, eps: f32 },
    Adadelta { rho: f32, eps: f32 },
}

/// Learning rate, weight decay and update rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optimizer {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub weight_decay: f32,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam {
                beta1: 0.5,
                beta2: 0.999,
                eps: 1e-8,
            },
            lr: 1e-3,
            weight_decay: 0.0,
        }
    }
}

impl Optimizer {
    /// Replace the weight decay (L2 strength).
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Validate optimizer hyperparameters.
    pub fn validate(&self) -> Result<()> {
        check(self.lr.is_finite() && self.lr > 0.0, "lr must be finite and > 0", self.lr)?;
        check(
            self.weight_decay.is_finite() && self.weight_decay >= 0.0,
            "weight_decay must be finite and >= 0",
            self.weight_decay,
        )?;

        match self.kind {
            OptimizerKind::Sgd {
                momentum,
                dampening,
                nesterov,
            } => {
                check(in_unit(momentum), "sgd momentum must be in [0,1)", momentum)?;
                check(
                    dampening.is_finite() && (0.0..=1.0).contains(&dampening),
                    "sgd dampening must be in [0,1]",
                    dampening,
                )?;
                if nesterov && (momentum == 0.0 || dampening != 0.0) {
                    return Err(Error::InvalidConfig(
                        "nesterov momentum requires momentum > 0 and zero dampening".to_owned(),
                    ));
                }
            }
            OptimizerKind::Adam { beta1, beta2, eps } | OptimizerKind::Adamax { beta1, beta2, eps } => {
                check(in_unit(beta1), "beta1 must be in [0,1)", beta1)?;
                check(in_unit(beta2), "beta2 must be in [0,1)", beta2)?;
                check(eps.is_finite() && eps > 0.0, "eps must be finite and > 0", eps)?;
            }
            OptimizerKind::RmsProp {
                alpha,
                eps,
                momentum,
            } => {
                check(in_unit(alpha), "rmsprop alpha must be in [0,1)", alpha)?;
                check(eps.is_finite() && eps > 0.0, "eps must be finite and > 0", eps)?;
                check(in_unit(momentum), "rmsprop momentum must be in [0,1)", momentum)?;
            }
            OptimizerKind::Adagrad { lr_decay, eps } => {
                check(
                    lr_decay.is_finite() && lr_decay >= 0.0,
                    "adagrad lr_decay must be finite and >= 0",
                    lr_decay,
                )?;
                check(eps.is_finite() && eps > 0.0, "eps must be finite and > 0", eps)?;
            }
            OptimizerKind::Adadelta { rho, eps } => {
                check(
                    rho.is_finite() && (0.0..=1.0).contains(&rho),
                    "adadelta rho must be in [0,1]",
                    rho,
                )?;
                check(eps.is_finite() && eps > 0.0, "eps must be finite and > 0", eps)?;
            }
        }
        Ok(())
    }

    /// Allocate optimizer state for `model`.
    pub fn state(self, model: &Mlp) -> Result<OptimizerState> {
        self.validate()?;

        let mut slots = Vec::with_capacity(2 * model.num_layers());
        for layer in model.layers() {
            slots.push(Slots::zeros(layer.weights().len()));
            slots.push(Slots::zeros(layer.biases().len()));
        }
        Ok(OptimizerState {
            optimizer: self,
            t: 0,
            slots,
        })
    }
}

impl FromStr for Optimizer {
    type Err = Error;

    /// Parse `"method"` or `"method,key=value,..."`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let method = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

        let mut params = Params::default();
        for pair in parts {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidConfig(format!("optimizer parameter {pair:?} is not key=value"))
            })?;
            let (key, value) = (key.trim(), value.trim());
            if !is_decimal(value) {
                return Err(Error::InvalidConfig(format!(
                    "optimizer parameter {key} has non-numeric value {value:?}"
                )));
            }
            let value = value
                .parse::<f32>()
                .map_err(|e| Error::InvalidConfig(format!("optimizer parameter {key}: {e}")))?;
            params.0.push((key.to_owned(), value));
        }

        let weight_decay = params.take("weight_decay").unwrap_or(0.0);
        let (kind, lr) = match method.as_str() {
            "sgd" => {
                let lr = params.take("lr").ok_or_else(|| {
                    Error::InvalidConfig("sgd requires an explicit lr (e.g. \"sgd,lr=0.1\")".to_owned())
                })?;
                let kind = OptimizerKind::Sgd {
                    momentum: params.take("momentum").unwrap_or(0.0),
                    dampening: params.take("dampening").unwrap_or(0.0),
                    nesterov: params.take("nesterov").is_some_and(|v| v != 0.0),
                };
                (kind, lr)
            }
            "adam" => {
                let lr = params.take("lr").unwrap_or(1e-3);
                let kind = OptimizerKind::Adam {
                    beta1: params.take("beta1").unwrap_or(0.5),
                    beta2: params.take("beta2").unwrap_or(0.999),
                    eps: params.take("eps").unwrap_or(1e-8),
                };
                (kind, lr)
            }
            "adamax" => {
                let lr = params.take("lr").unwrap_or(2e-3);
                let kind = OptimizerKind::Adamax {
                    beta1: params.take("beta1").unwrap_or(0.9),
                    beta2: params.take("beta2").unwrap_or(0.999),
                    eps: params.take("eps").unwrap_or(1e-8),
                };
                (kind, lr)
            }
            "rmsprop" => {
                let lr = params.take("lr").unwrap_or(1e-2);
                let kind = OptimizerKind::RmsProp {
                    alpha: params.take("alpha").unwrap_or(0.99),
                    eps: params.take("eps").unwrap_or(1e-8),
                    momentum: params.take("momentum").unwrap_or(0.0),
                };
                (kind, lr)
            }
            "adagrad" => {
                let lr = params.take("lr").unwrap_or(1e-2);
                let kind = OptimizerKind::Adagrad {
                    lr_decay: params.take("lr_decay").unwrap_or(0.0),
                    eps: params.take("eps").unwrap_or(1e-10),
                };
                (kind, lr)
            }
            "adadelta" => {
                let lr = params.take("lr").unwrap_or(1.0);
                let kind = OptimizerKind::Adadelta {
                    rho: params.take("rho").unwrap_or(0.9),
                    eps: params.take("eps").unwrap_or(1e-6),
                };
                (kind, lr)
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown optimization method {other:?}"
                )));
            }
        };

        if let Some((key, _)) = params.0.first() {
            return Err(Error::InvalidConfig(format!(
                "unexpected parameter {key:?} for optimizer {method:?}"
            )));
        }
        let opt = Optimizer {
            kind,
            lr,
            weight_decay,
        };
        opt.validate()?;
        Ok(opt)
    }
}

/// Key/value pairs left to consume while resolving an optimizer string.
#[derive(Default)]
struct Params(Vec<(String, f32)>);

impl Params {
    fn take(&mut self, key: &str) -> Option<f32> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }
}

#[derive(Debug, Clone, Default)]
struct Slots {
    a: Vec<f32>,
    b: Vec<f32>,
}

impl Slots {
    fn zeros(len: usize) -> Self {
        Self {
            a: vec![0.0; len],
            b: vec![0.0; len],
        }
    }
}

/// Owned optimizer state: step counter plus two buffers per parameter tensor.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    optimizer: Optimizer,
    t: u64,
    slots: Vec<Slots>,
}

impl OptimizerState {
    #[inline]
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Number of steps taken so far.
    #[inline]
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Apply one optimizer step to every parameter of `model`.
    pub fn step(&mut self, model: &mut Mlp, grads: &Gradients) {
        assert_eq!(
            self.slots.len(),
            2 * model.num_layers(),
            "optimizer state was built for a different model"
        );
        self.t += 1;

        let opt = self.optimizer;
        let t = self.t;
        for layer_idx in 0..model.num_layers() {
            let (weights, biases) = model.layer_mut(layer_idx).params_mut();
            let (sw, sb) = self.slots[2 * layer_idx..].split_at_mut(1);
            update(&opt, t, weights, grads.d_weights(layer_idx), &mut sw[0]);
            update(&opt, t, biases, grads.d_biases(layer_idx), &mut sb[0]);
        }
    }
}

fn update(opt: &Optimizer, t: u64, params: &mut [f32], grads: &[f32], slots: &mut Slots) {
    debug_assert_eq!(params.len(), grads.len());
    debug_assert_eq!(params.len(), slots.a.len());

    let lr = opt.lr;
    let wd = opt.weight_decay;
    let tf = t as f32;

    match opt.kind {
        OptimizerKind::Sgd {
            momentum,
            dampening,
            nesterov,
        } => {
            for i in 0..params.len() {
                let mut g = wd.mul_add(params[i], grads[i]);
                if momentum != 0.0 {
                    let buf = &mut slots.a[i];
                    *buf = if t == 1 {
                        g
                    } else {
                        momentum * *buf + (1.0 - dampening) * g
                    };
                    g = if nesterov { momentum.mul_add(*buf, g) } else { *buf };
                }
                params[i] -= lr * g;
            }
        }
        OptimizerKind::Adam { beta1, beta2, eps } => {
            let corr1 = 1.0 - beta1.powf(tf);
            let corr2_sqrt = (1.0 - beta2.powf(tf)).sqrt();
            let step_size = lr / corr1;
            for i in 0..params.len() {
                let g = wd.mul_add(params[i], grads[i]);
                let m = &mut slots.a[i];
                let v = &mut slots.b[i];
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / corr2_sqrt + eps;
                params[i] -= step_size * *m / denom;
            }
        }
        OptimizerKind::Adamax { beta1, beta2, eps } => {
            let step_size = lr / (1.0 - beta1.powf(tf));
            for i in 0..params.len() {
                let g = wd.mul_add(params[i], grads[i]);
                let m = &mut slots.a[i];
                let u = &mut slots.b[i];
                *m = beta1 * *m + (1.0 - beta1) * g;
                *u = (beta2 * *u).max(g.abs() + eps);
                params[i] -= step_size * *m / *u;
            }
        }
        OptimizerKind::RmsProp {
            alpha,
            eps,
            momentum,
        } => {
            for i in 0..params.len() {
                let g = wd.mul_add(params[i], grads[i]);
                let sq = &mut slots.a[i];
                *sq = alpha * *sq + (1.0 - alpha) * g * g;
                let avg = sq.sqrt() + eps;
                if momentum > 0.0 {
                    let buf = &mut slots.b[i];
                    *buf = momentum * *buf + g / avg;
                    params[i] -= lr * *buf;
                } else {
                    params[i] -= lr * g / avg;
                }
            }
        }
        OptimizerKind::Adagrad { lr_decay, eps } => {
            let clr = lr / (1.0 + (tf - 1.0) * lr_decay);
            for i in 0..params.len() {
                let g = wd.mul_add(params[i], grads[i]);
                let sum = &mut slots.a[i];
                *sum += g * g;
                params[i] -= clr * g / (sum.sqrt() + eps);
            }
        }
        OptimizerKind::Adadelta { rho, eps } => {
            for i in 0..params.len() {
                let g = wd.mul_add(params[i], grads[i]);
                let sq = &mut slots.a[i];
                *sq = rho * *sq + (1.0 - rho) * g * g;
                let std = (*sq + eps).sqrt();
                let acc = &mut slots.b[i];
                let delta = (*acc + eps).sqrt() / std * g;
                *acc = rho * *acc + (1.0 - rho) * delta * delta;
                params[i] -= lr * delta;
            }
        }
    }
}

#[inline]
fn in_unit(x: f32) -> bool {
    x.is_finite() && (0.0..1.0).contains(&x)
}

#[inline]
fn check(ok: bool, what: &str, got: f32) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("{what}, got {got}")))
    }
}

/// `[+-]?(digits[.digits*] | .digits)`; exponents, `inf` and `nan` are rejected.
fn is_decimal(s: &str) -> bool {
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    match frac {
        None => !int.is_empty() && digits(int),
        Some(frac) if int.is_empty() => !frac.is_empty() && digits(frac),
        Some(frac) => digits(int) && digits(frac),
    }
}
