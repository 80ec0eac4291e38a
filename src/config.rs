//! Evaluation configuration.
//!
//! Every optional key has a documented default; a missing key means "use the
//! default", never an error. With the `serde` feature both structs deserialize
//! with `#[serde(default)]`, so partial JSON objects are accepted.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Optimizer, Result};

/// Seed used by the reference configuration.
pub const DEFAULT_SEED: u64 = 1111;

/// Compute target for the gradient-trained classifier.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            other => Err(Error::InvalidConfig(format!(
                "unsupported device {other:?}; only \"cpu\" is available"
            ))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Hyperparameters of the gradient-trained probe.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
    /// Hidden units; 0 trains a logistic regression. Default 0.
    pub nhid: usize,
    /// Optimizer string, e.g. `"adam"` or `"sgd,lr=0.1"`. Default `"adam"`.
    pub optim: String,
    /// Non-improving validation rounds tolerated before stopping. Default 5.
    pub tenacity: usize,
    /// Passes over the training set per validation round. Default 4.
    pub epoch_size: usize,
    /// Upper bound on passes over the training set. Default 200.
    pub max_epoch: usize,
    /// Dropout probability on the hidden layer. Default 0.
    pub dropout: f32,
    /// Mini-batch size. Default 64.
    pub batch_size: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            nhid: 0,
            optim: "adam".to_owned(),
            tenacity: 5,
            epoch_size: 4,
            max_epoch: 200,
            dropout: 0.0,
            batch_size: 64,
        }
    }
}

impl MlpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        if self.epoch_size == 0 {
            return Err(Error::InvalidConfig("epoch_size must be > 0".to_owned()));
        }
        if !(self.dropout.is_finite() && (0.0..1.0).contains(&self.dropout)) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0,1), got {}",
                self.dropout
            )));
        }
        self.optimizer()?;
        Ok(())
    }

    /// Resolve the optimizer string.
    pub fn optimizer(&self) -> Result<Optimizer> {
        self.optim.parse()
    }
}

/// Configuration shared by the validation strategies.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct EvalConfig {
    /// Number of classes; labels must lie in `0..nclasses`. Default 2.
    pub nclasses: usize,
    /// Seed for model initialisation and shuffling. Default 1111.
    pub seed: u64,
    /// `true` selects the gradient-trained MLP probe, `false` the L-BFGS
    /// logistic regression. Default `true`.
    pub usepytorch: bool,
    pub classifier: MlpConfig,
    /// Number of folds. Default 5.
    pub kfold: usize,
    /// Default cpu.
    pub device: Device,
    /// Skip the L2 grid in the fixed-split strategy. Default false.
    pub noreg: bool,
    /// Iteration cap of the logistic regression solver. Default 100.
    pub max_iter: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            nclasses: 2,
            seed: DEFAULT_SEED,
            usepytorch: true,
            classifier: MlpConfig::default(),
            kfold: 5,
            device: Device::Cpu,
            noreg: false,
            max_iter: 100,
        }
    }
}

impl EvalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nclasses < 2 {
            return Err(Error::InvalidConfig(format!(
                "nclasses must be >= 2, got {}",
                self.nclasses
            )));
        }
        if self.kfold < 2 {
            return Err(Error::InvalidConfig(format!(
                "kfold must be >= 2, got {}",
                self.kfold
            )));
        }
        if self.max_iter == 0 {
            return Err(Error::InvalidConfig("max_iter must be > 0".to_owned()));
        }
        if self.usepytorch {
            self.classifier.validate()?;
        }
        Ok(())
    }

    /// Descriptive model name used in log lines.
    pub fn classifier_name(&self) -> String {
        if self.usepytorch {
            format!(
                "mlp-nhid{}-{}-bs{}",
                self.classifier.nhid, self.classifier.optim, self.classifier.batch_size
            )
        } else {
            "logreg".to_owned()
        }
    }
}

#[cfg(feature = "serde")]
impl EvalConfig {
    /// Parse and validate a configuration from JSON; absent keys take defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: EvalConfig = serde_json::from_str(s)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EvalConfig::default().validate().is_ok());
        assert_eq!(EvalConfig::default().classifier_name(), "mlp-nhid0-adam-bs64");
    }

    #[test]
    fn rejects_nonsense() {
        let cfg = EvalConfig {
            kfold: 1,
            ..EvalConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = EvalConfig::default();
        cfg.classifier.optim = "sgd".to_owned();
        assert!(cfg.validate().is_err());

        // The MLP section is ignored by the logistic regression backend.
        cfg.usepytorch = false;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.classifier_name(), "logreg");
    }

    #[test]
    fn device_parsing() {
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert!("cuda".parse::<Device>().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_missing_keys_fall_back_to_defaults() {
        let cfg = EvalConfig::from_json_str(
            r#"{"nclasses": 3, "classifier": {"nhid": 50, "optim": "rmsprop"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.nclasses, 3);
        assert_eq!(cfg.kfold, 5);
        assert_eq!(cfg.seed, DEFAULT_SEED);
        assert_eq!(cfg.classifier.nhid, 50);
        assert_eq!(cfg.classifier.tenacity, 5);
        assert_eq!(cfg.classifier.batch_size, 64);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rejects_unknown_device_and_classifier_keys() {
        assert!(EvalConfig::from_json_str(r#"{"device": "cuda"}"#).is_err());
        assert!(EvalConfig::from_json_str(r#"{"classifier": {"nhidden": 3}}"#).is_err());
    }
}
