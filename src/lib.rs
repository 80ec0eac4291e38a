//! Linear and shallow-MLP probes with cross-validated L2 selection.
//!
//! `probe-cv` evaluates fixed-length feature vectors (for example sentence
//! embeddings) by training a small classifier on top of them. The search picks
//! an L2 strength on held-out data, retrains the winner and reports test
//! accuracy.
//!
//! # Pieces
//!
//! - [`MlpClassifier`]: logistic regression (`nhid == 0`) or a
//!   linear/dropout/sigmoid/linear network, trained with summed cross-entropy,
//!   mini-batches and early stopping on validation accuracy.
//! - [`LogisticRegression`]: the same linear model solved with L-BFGS.
//! - [`Optimizer`]: parsed from strings like `"adam"` or `"sgd,lr=0.1,momentum=0.9"`.
//! - Strategies: [`InnerKFoldClassifier`], [`KFoldClassifier`],
//!   [`SplitClassifier`].
//!
//! # Panics vs `Result`
//!
//! Kernels ([`Layer`], [`Mlp::forward_batch`], [`loss`]) treat shape mismatches
//! as programmer error and panic via `assert!`. Everything reachable from the
//! classifiers and strategies validates its inputs and returns [`Result`].
//!
//! # Data layout
//!
//! - Scalars are `f32` (the closed-form solver works in `f64` internally).
//! - [`Features`] stores samples contiguously in row-major layout.
//! - Layer weights are row-major with shape `(out_dim, in_dim)`.
//!
//! # Logging
//!
//! Progress is reported through `tracing` events. The library never installs a
//! subscriber.
//!
//! # Quick start
//!
//! ```rust
//! use probe_cv::{Dataset, EvalConfig, SplitClassifier};
//!
//! # fn main() -> probe_cv::Result<()> {
//! let xs: Vec<Vec<f32>> = (0..40)
//!     .map(|i| {
//!         let side = if i % 2 == 0 { -1.0 } else { 1.0 };
//!         vec![side * (1.0 + (i % 5) as f32 * 0.1), 0.1 * (i % 3) as f32]
//!     })
//!     .collect();
//! let ys: Vec<usize> = (0..40).map(|i| i % 2).collect();
//! let data = Dataset::from_rows(&xs, &ys)?;
//!
//! let config = EvalConfig {
//!     usepytorch: false,
//!     ..EvalConfig::default()
//! };
//! let report = SplitClassifier::new(&data, &data, &data, config)?.run()?;
//! assert_eq!(report.test_accuracy, 100.0);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod classifier;
pub mod config;
pub mod data;
pub mod early_stop;
pub mod error;
pub mod folds;
pub mod layer;
pub mod logreg;
pub mod loss;
pub(crate) mod matmul;
pub mod metrics;
pub mod mlp;
pub mod optim;
pub mod validation;

pub use activation::Activation;
pub use classifier::{Classifier, Holdout, MlpClassifier};
pub use config::{DEFAULT_SEED, Device, EvalConfig, MlpConfig};
pub use data::{Dataset, Features};
pub use early_stop::{EarlyStopping, StopReport, Verdict};
pub use error::{Error, Result};
pub use folds::{Fold, stratified_kfold};
pub use layer::Layer;
pub use logreg::LogisticRegression;
pub use mlp::{BatchScratch, Gradients, Mlp};
pub use optim::{Optimizer, OptimizerKind, OptimizerState};
pub use validation::{
    EvalReport, InnerKFoldClassifier, KFoldClassifier, KFoldReport, SplitClassifier, select_best,
};
