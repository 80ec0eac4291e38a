//! Classifiers used by the validation strategies.
//!
//! Strategies only see the [`Classifier`] trait. Two implementations exist:
//!
//! - [`MlpClassifier`]: mini-batch gradient training with early stopping on a
//!   held-out split.
//! - [`crate::LogisticRegression`]: deterministic L-BFGS solve of a
//!   multinomial logistic regression (ignores the holdout).

use std::borrow::Cow;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::early_stop::{EarlyStopping, train_with_early_stopping};
use crate::metrics::{accuracy, argmax};
use crate::{
    BatchScratch, Dataset, Device, Error, EvalConfig, Features, Gradients, LogisticRegression,
    Mlp, MlpConfig, OptimizerState, Result, loss,
};

/// Held-out data used to drive early stopping.
#[derive(Debug, Clone, Copy)]
pub enum Holdout<'a> {
    /// An explicit validation set.
    Data(&'a Dataset),
    /// Carve this fraction (in (0,1)) out of the training data.
    Split(f32),
}

/// The interface shared by the gradient-trained and closed-form classifiers.
pub trait Classifier {
    /// Train on `data`. Implementations that do not early-stop ignore `holdout`.
    fn fit(&mut self, data: &Dataset, holdout: Holdout<'_>) -> Result<()>;

    /// Fraction of rows whose predicted class equals the label.
    fn score(&self, data: &Dataset) -> Result<f32> {
        if data.is_empty() {
            return Err(Error::InvalidData("cannot score an empty dataset".to_owned()));
        }
        let predictions = self.predict(data.features())?;
        Ok(accuracy(&predictions, data.labels()))
    }

    /// Predicted class index per row, in input order.
    fn predict(&self, features: &Features) -> Result<Vec<usize>>;

    /// Class probabilities, flat with shape `(len, nclasses)`.
    fn predict_proba(&self, features: &Features) -> Result<Vec<f32>>;
}

impl EvalConfig {
    /// Build the classifier selected by `usepytorch` for one trial L2 value.
    pub fn build_classifier(&self, input_dim: usize, reg: f64) -> Result<Box<dyn Classifier>> {
        if self.usepytorch {
            Ok(Box::new(MlpClassifier::new(
                input_dim,
                self.nclasses,
                reg as f32,
                &self.classifier,
                self.seed,
                self.device,
            )?))
        } else {
            Ok(Box::new(LogisticRegression::new(
                input_dim,
                self.nclasses,
                reg,
                self.max_iter,
            )?))
        }
    }
}

/// Buffers and RNG state owned across training passes.
#[derive(Debug, Clone)]
struct TrainState {
    rng: StdRng,
    optim: OptimizerState,
    scratch: BatchScratch,
    grads: Gradients,
    x_batch: Vec<f32>,
    y_batch: Vec<usize>,
    nepoch: usize,
}

impl TrainState {
    /// Run `passes` shuffled passes over `train`; returns the summed loss of the
    /// last pass.
    fn run_passes(
        &mut self,
        model: &mut Mlp,
        train: &Dataset,
        passes: usize,
        batch_size: usize,
    ) -> Result<f32> {
        let nclasses = model.output_dim();
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut pass_loss = 0.0_f32;

        for _ in 0..passes {
            order.shuffle(&mut self.rng);
            pass_loss = 0.0;

            for chunk in order.chunks(batch_size) {
                let rows = chunk.len();
                self.x_batch.clear();
                self.y_batch.clear();
                for &idx in chunk {
                    self.x_batch.extend_from_slice(train.features().row(idx));
                    self.y_batch.push(train.labels()[idx]);
                }

                let logits =
                    model.forward_batch_train(&self.x_batch, rows, &mut self.scratch, &mut self.rng);
                let batch_loss = loss::cross_entropy_sum_backward(
                    logits,
                    &self.y_batch,
                    nclasses,
                    self.grads.d_logits_mut(rows, nclasses),
                );
                if !batch_loss.is_finite() {
                    return Err(Error::Diverged(format!(
                        "non-finite loss {batch_loss} during pass {}",
                        self.nepoch + 1
                    )));
                }
                model.backward_batch(&self.x_batch, &self.scratch, &mut self.grads);
                self.optim.step(model, &self.grads);
                pass_loss += batch_loss;
            }

            self.nepoch += 1;
            trace!(pass = self.nepoch, loss = pass_loss, "training pass");
        }
        Ok(pass_loss)
    }
}

/// Logistic regression (`nhid == 0`) or one-hidden-layer perceptron trained by
/// mini-batch gradient descent with early stopping.
#[derive(Debug, Clone)]
pub struct MlpClassifier {
    config: MlpConfig,
    l2reg: f32,
    device: Device,
    model: Mlp,
    state: TrainState,
}

impl MlpClassifier {
    /// Build an untrained classifier.
    ///
    /// All randomness (weight init, validation split, shuffling, dropout) comes
    /// from one `StdRng` seeded with `seed`.
    pub fn new(
        input_dim: usize,
        nclasses: usize,
        l2reg: f32,
        config: &MlpConfig,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        if nclasses < 2 {
            return Err(Error::InvalidConfig(format!(
                "nclasses must be >= 2, got {nclasses}"
            )));
        }
        let optimizer = config.optimizer()?.with_weight_decay(l2reg);

        let mut rng = StdRng::seed_from_u64(seed);
        let model = Mlp::new_with_rng(input_dim, config.nhid, nclasses, config.dropout, &mut rng)?;
        let state = TrainState {
            rng,
            optim: optimizer.state(&model)?,
            scratch: model.scratch(config.batch_size),
            grads: model.gradients(config.batch_size),
            x_batch: Vec::with_capacity(config.batch_size * input_dim),
            y_batch: Vec::with_capacity(config.batch_size),
            nepoch: 0,
        };

        Ok(Self {
            config: config.clone(),
            l2reg,
            device,
            model,
            state,
        })
    }

    #[inline]
    pub fn model(&self) -> &Mlp {
        &self.model
    }

    #[inline]
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    #[inline]
    pub fn l2reg(&self) -> f32 {
        self.l2reg
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Passes over the training data performed by the last `fit`.
    #[inline]
    pub fn epochs_trained(&self) -> usize {
        self.state.nepoch
    }

    /// Resolve the training and validation sets.
    ///
    /// Exactly one of `validation_data` / `validation_split` must be given. With a
    /// split fraction, one permutation of the rows is drawn and its first
    /// `floor(split * len)` entries become the validation set.
    pub fn prepare_split<'a>(
        &mut self,
        data: &'a Dataset,
        validation_data: Option<&'a Dataset>,
        validation_split: Option<f32>,
    ) -> Result<(Cow<'a, Dataset>, Cow<'a, Dataset>)> {
        match (validation_data, validation_split) {
            (Some(valid), None) => Ok((Cow::Borrowed(data), Cow::Borrowed(valid))),
            (None, Some(split)) => {
                if !(split > 0.0 && split < 1.0) {
                    return Err(Error::InvalidArgument(format!(
                        "validation_split must be in (0,1), got {split}"
                    )));
                }
                let n_valid = (f64::from(split) * data.len() as f64) as usize;
                if n_valid == 0 || n_valid == data.len() {
                    return Err(Error::InvalidData(format!(
                        "validation_split {split} of {} rows leaves an empty side",
                        data.len()
                    )));
                }

                let mut permutation: Vec<usize> = (0..data.len()).collect();
                permutation.shuffle(&mut self.state.rng);
                let (valid_idx, train_idx) = permutation.split_at(n_valid);
                Ok((
                    Cow::Owned(data.subset(train_idx)),
                    Cow::Owned(data.subset(valid_idx)),
                ))
            }
            (Some(_), Some(_)) => Err(Error::InvalidArgument(
                "pass either validation_data or validation_split, not both".to_owned(),
            )),
            (None, None) => Err(Error::InvalidArgument(
                "one of validation_data or validation_split is required".to_owned(),
            )),
        }
    }

    /// Train with early stopping on the held-out set.
    ///
    /// Each round runs `epoch_size` passes and then scores the validation set.
    /// Training ends after `tenacity` consecutive non-improving rounds (when
    /// `early_stop` is set) or once `max_epoch` passes have run; the last round is
    /// shortened so the cap is exact. At least one pass always runs. The model is left
    /// at the best-scoring snapshot, and that score is returned.
    pub fn fit_with_validation(
        &mut self,
        data: &Dataset,
        validation_data: Option<&Dataset>,
        validation_split: Option<f32>,
        early_stop: bool,
    ) -> Result<f32> {
        let (train, valid) = self.prepare_split(data, validation_data, validation_split)?;
        self.check_dataset(&train, "train")?;
        self.check_dataset(&valid, "validation")?;

        self.state.nepoch = 0;
        let pass_budget = self.config.max_epoch.max(1);
        let max_rounds = pass_budget.div_ceil(self.config.epoch_size);
        let policy = EarlyStopping::new(self.config.tenacity, early_stop);

        let config = &self.config;
        let state = &mut self.state;
        let report = train_with_early_stopping(&mut self.model, policy, max_rounds, |model| {
            let passes = config.epoch_size.min(pass_budget - state.nepoch);
            state.run_passes(model, &train, passes, config.batch_size)?;
            score_model(model, &valid, config.batch_size)
        })?;

        debug!(
            best_score = report.best_score,
            best_round = report.best_round,
            rounds = report.rounds,
            passes = self.state.nepoch,
            "early stopping finished"
        );
        Ok(report.best_score)
    }

    /// Run `epoch_size` shuffled passes over `train` without validation.
    ///
    /// Returns the summed loss of the last pass.
    pub fn train_epoch(&mut self, train: &Dataset, epoch_size: usize) -> Result<f32> {
        self.check_dataset(train, "train")?;
        self.state
            .run_passes(&mut self.model, train, epoch_size, self.config.batch_size)
    }

    fn check_dataset(&self, data: &Dataset, what: &str) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidData(format!("{what} dataset must not be empty")));
        }
        self.check_features(data.features())?;
        data.check_labels(self.model.output_dim())
    }

    fn check_features(&self, features: &Features) -> Result<()> {
        if features.dim() != self.model.input_dim() {
            return Err(Error::InvalidShape(format!(
                "feature dim {} does not match model input_dim {}",
                features.dim(),
                self.model.input_dim()
            )));
        }
        Ok(())
    }
}

impl Classifier for MlpClassifier {
    fn fit(&mut self, data: &Dataset, holdout: Holdout<'_>) -> Result<()> {
        match holdout {
            Holdout::Data(valid) => self.fit_with_validation(data, Some(valid), None, true)?,
            Holdout::Split(split) => self.fit_with_validation(data, None, Some(split), true)?,
        };
        Ok(())
    }

    fn predict(&self, features: &Features) -> Result<Vec<usize>> {
        self.check_features(features)?;
        let mut predictions = Vec::with_capacity(features.len());
        for_each_logits(&self.model, features, self.config.batch_size, |logits| {
            predictions.extend(
                logits
                    .chunks_exact(self.model.output_dim())
                    .map(|row| argmax(row).unwrap_or(0)),
            );
        });
        Ok(predictions)
    }

    fn predict_proba(&self, features: &Features) -> Result<Vec<f32>> {
        self.check_features(features)?;
        let nclasses = self.model.output_dim();
        let mut probas = vec![0.0_f32; features.len() * nclasses];
        let mut offset = 0;
        for_each_logits(&self.model, features, self.config.batch_size, |logits| {
            let out = &mut probas[offset..offset + logits.len()];
            loss::softmax_rows(logits, nclasses, out);
            offset += logits.len();
        });
        Ok(probas)
    }
}

/// Batched inference in input order; `f` sees each batch's logits.
fn for_each_logits(model: &Mlp, features: &Features, batch_size: usize, mut f: impl FnMut(&[f32])) {
    let mut scratch = model.scratch(batch_size);
    let mut start = 0;
    while start < features.len() {
        let end = (start + batch_size).min(features.len());
        let logits = model.forward_batch(features.rows(start, end), end - start, &mut scratch);
        f(logits);
        start = end;
    }
}

fn score_model(model: &Mlp, data: &Dataset, batch_size: usize) -> Result<f32> {
    let nclasses = model.output_dim();
    let mut correct = 0_usize;
    let mut start = 0;
    for_each_logits(model, data.features(), batch_size, |logits| {
        for (row, &label) in logits
            .chunks_exact(nclasses)
            .zip(&data.labels()[start..])
        {
            if argmax(row) == Some(label) {
                correct += 1;
            }
        }
        start += logits.len() / nclasses;
    });
    if data.is_empty() {
        return Err(Error::InvalidData("cannot score an empty dataset".to_owned()));
    }
    Ok(correct as f32 / data.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;

    /// Two Gaussian-ish blobs in `dim` dimensions, separable along every axis.
    fn blobs(n: usize, dim: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut values = Vec::with_capacity(n * dim);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            let center = if label == 0 { -1.0 } else { 1.0 };
            for _ in 0..dim {
                values.push(center + rng.gen_range(-0.5..0.5));
            }
            labels.push(label);
        }
        Dataset::from_flat(values, dim, labels).unwrap()
    }

    fn classifier(dim: usize, config: MlpConfig) -> MlpClassifier {
        MlpClassifier::new(dim, 2, 0.0, &config, 1111, Device::Cpu).unwrap()
    }

    #[test]
    fn prepare_split_requires_exactly_one_source() {
        let data = blobs(10, 2, 0);
        let mut clf = classifier(2, MlpConfig::default());
        assert!(matches!(
            clf.prepare_split(&data, None, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            clf.prepare_split(&data, Some(&data), Some(0.1)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            clf.prepare_split(&data, None, Some(1.5)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            clf.fit_with_validation(&data, None, None, true),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn prepare_split_partitions_by_one_permutation() {
        // Row i carries feature value i so rows can be traced back.
        let values: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let labels = (0..100).map(|i| i % 2).collect();
        let data = Dataset::from_flat(values, 1, labels).unwrap();

        let mut clf = classifier(1, MlpConfig::default());
        let (train, valid) = clf.prepare_split(&data, None, Some(0.2)).unwrap();
        assert_eq!(train.len(), 80);
        assert_eq!(valid.len(), 20);

        let mut seen: Vec<usize> = train
            .features()
            .as_flat()
            .iter()
            .chain(valid.features().as_flat())
            .map(|&v| v as usize)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn split_leaving_an_empty_side_is_rejected() {
        let data = blobs(10, 2, 6);
        let mut clf = classifier(2, MlpConfig::default());
        // floor(0.05 * 10) == 0 rows of validation.
        assert!(matches!(
            clf.prepare_split(&data, None, Some(0.05)),
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            Classifier::fit(&mut clf, &data, Holdout::Split(0.05)),
            Err(Error::InvalidData(_))
        ));
        let (train, valid) = clf.prepare_split(&data, None, Some(0.1)).unwrap();
        assert_eq!((train.len(), valid.len()), (9, 1));
    }

    #[test]
    fn max_epoch_caps_passes_exactly() {
        let data = blobs(40, 2, 7);
        for (max_epoch, epoch_size, expected) in [(10, 4, 10), (8, 4, 8), (3, 5, 3), (0, 4, 1)] {
            let config = MlpConfig {
                max_epoch,
                epoch_size,
                ..MlpConfig::default()
            };
            let mut clf = classifier(2, config);
            clf.fit_with_validation(&data, Some(&data), None, false).unwrap();
            assert_eq!(
                clf.epochs_trained(),
                expected,
                "max_epoch={max_epoch} epoch_size={epoch_size}"
            );
        }
    }

    #[test]
    fn linear_probe_separates_blobs() {
        let train = blobs(200, 10, 1);
        let config = MlpConfig {
            nhid: 0,
            max_epoch: 50,
            ..MlpConfig::default()
        };
        let mut clf = classifier(10, config);
        let best = clf.fit_with_validation(&train, Some(&train), None, true).unwrap();
        assert!(best >= 0.95, "validation accuracy {best}");
        assert!(clf.epochs_trained() <= 50);
    }

    #[test]
    fn score_matches_predict() {
        let data = blobs(120, 4, 2);
        let config = MlpConfig {
            nhid: 8,
            dropout: 0.1,
            max_epoch: 8,
            ..MlpConfig::default()
        };
        let mut clf = classifier(4, config);
        Classifier::fit(&mut clf, &data, Holdout::Data(&data)).unwrap();

        let predictions = clf.predict(data.features()).unwrap();
        assert_eq!(predictions.len(), data.len());
        let score = clf.score(&data).unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(score, accuracy(&predictions, data.labels()));
        assert_eq!(score, score_model(clf.model(), &data, 64).unwrap());
    }

    #[test]
    fn predict_proba_covers_every_batch() {
        let data = blobs(150, 3, 3);
        let config = MlpConfig {
            batch_size: 64,
            max_epoch: 4,
            ..MlpConfig::default()
        };
        let mut clf = classifier(3, config);
        Classifier::fit(&mut clf, &data, Holdout::Split(0.2)).unwrap();

        let probas = clf.predict_proba(data.features()).unwrap();
        assert_eq!(probas.len(), 150 * 2);
        for row in probas.chunks_exact(2) {
            assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
        }
        // The tail batch (rows 128..150) must be filled in too.
        assert!(probas[128 * 2..].iter().all(|&p| p > 0.0));
    }

    #[test]
    fn same_seed_gives_same_model() {
        let data = blobs(60, 3, 4);
        let config = MlpConfig {
            nhid: 4,
            max_epoch: 8,
            ..MlpConfig::default()
        };
        let mut a = classifier(3, config.clone());
        let mut b = classifier(3, config);
        a.fit_with_validation(&data, None, Some(0.25), true).unwrap();
        b.fit_with_validation(&data, None, Some(0.25), true).unwrap();
        assert_eq!(a.model(), b.model());
    }

    #[test]
    fn rejects_wrong_feature_dim() {
        let data = blobs(10, 3, 5);
        let clf = classifier(4, MlpConfig::default());
        assert!(matches!(clf.predict(data.features()), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn divergence_is_reported() {
        let values = vec![1e30_f32; 40];
        let labels = (0..20).map(|i| i % 2).collect();
        let data = Dataset::from_flat(values, 2, labels).unwrap();
        let config = MlpConfig {
            optim: "sgd,lr=1".to_owned(),
            max_epoch: 8,
            ..MlpConfig::default()
        };
        let mut clf = classifier(2, config);
        let err = clf.fit_with_validation(&data, Some(&data), None, true);
        assert!(matches!(err, Err(Error::Diverged(_))), "{err:?}");
    }
}
