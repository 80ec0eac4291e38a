//! Model selection over the L2 strength.
//!
//! Three strategies share one loop: score every regularisation candidate on
//! held-out data, keep the first best one, retrain with it and report test
//! accuracy. Accuracies are reported as percentages rounded to two decimals.

use std::ops::RangeInclusive;

#[cfg(feature = "serde")]
use serde::Serialize;
use tracing::{debug, info};

use crate::classifier::Holdout;
use crate::folds::{Fold, stratified_kfold};
use crate::metrics::{argmax, mean, percent, round2};
use crate::{Dataset, Error, EvalConfig, Result};

/// Fold seed of the nested strategy, independent of the configured seed.
pub const INNER_FOLD_SEED: u64 = 1111;

/// Fraction of the training set held out for early stopping when retraining
/// the winning candidate in the k-fold strategies.
pub const RETRAIN_VALIDATION_SPLIT: f32 = 0.05;

const MLP_EXPONENTS: RangeInclusive<i32> = -5..=-2;
const NOREG_MLP: f64 = 1e-9;
const NOREG_LOGREG: f64 = 1e9;

/// Result of the nested and fixed-split strategies.
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    /// Best held-out accuracy of the search, in percent.
    pub dev_accuracy: f64,
    /// Test accuracy of the retrained winner, in percent.
    pub test_accuracy: f64,
}

/// Result of [`KFoldClassifier`]: the report plus test-set predictions.
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct KFoldReport {
    pub dev_accuracy: f64,
    pub test_accuracy: f64,
    pub predictions: Vec<usize>,
}

/// Index and value of the best score; ties go to the earliest candidate.
pub fn select_best(scores: &[f64]) -> Option<(usize, f64)> {
    argmax(scores).map(|idx| (idx, scores[idx]))
}

/// Candidate L2 values: powers of ten for the MLP probe, powers of two (inverse
/// strength) over `closed_form` for the logistic regression.
fn candidate_regs(config: &EvalConfig, closed_form: RangeInclusive<i32>) -> Vec<f64> {
    if config.usepytorch {
        MLP_EXPONENTS.map(|t| 10_f64.powi(t)).collect()
    } else {
        closed_form.map(|t| 2_f64.powi(t)).collect()
    }
}

fn check_inputs(config: &EvalConfig, datasets: &[(&str, &Dataset)]) -> Result<()> {
    config.validate()?;
    let dim = datasets.first().map_or(0, |(_, data)| data.dim());
    for (name, data) in datasets {
        if data.is_empty() {
            return Err(Error::InvalidData(format!("{name} dataset must not be empty")));
        }
        if data.dim() != dim {
            return Err(Error::InvalidShape(format!(
                "{name} dataset has dim {}, expected {dim}",
                data.dim()
            )));
        }
        data.check_labels(config.nclasses)?;
    }
    Ok(())
}

/// Mean fold accuracy (percent) of one candidate, each fold trained with its
/// own test part as the early-stopping holdout.
fn cross_validate(config: &EvalConfig, data: &Dataset, folds: &[Fold], reg: f64) -> Result<f64> {
    let mut accuracies = Vec::with_capacity(folds.len());
    for fold in folds {
        let train = data.subset(&fold.train);
        let test = data.subset(&fold.test);
        let mut clf = config.build_classifier(data.dim(), reg)?;
        clf.fit(&train, Holdout::Data(&test))?;
        accuracies.push(clf.score(&test)?);
    }
    Ok(percent(&accuracies))
}

/// Score every candidate with `score` and return the winner.
fn grid_search(
    regs: &[f64],
    mut score: impl FnMut(f64) -> Result<f64>,
) -> Result<(f64, f64)> {
    let mut scores = Vec::with_capacity(regs.len());
    for &reg in regs {
        let value = score(reg)?;
        debug!(reg, score = value, "candidate scored");
        scores.push(value);
    }
    let (idx, best) = select_best(&scores)
        .ok_or_else(|| Error::InvalidConfig("empty regularisation grid".to_owned()))?;
    Ok((regs[idx], best))
}

/// Nested cross-validation on a single dataset.
///
/// The outer stratified k-fold estimates test accuracy; inside each outer train
/// part an inner stratified k-fold picks the L2 strength.
#[derive(Debug, Clone)]
pub struct InnerKFoldClassifier<'a> {
    data: &'a Dataset,
    config: EvalConfig,
}

impl<'a> InnerKFoldClassifier<'a> {
    pub fn new(data: &'a Dataset, config: EvalConfig) -> Result<Self> {
        check_inputs(&config, &[("data", data)])?;
        Ok(Self { data, config })
    }

    pub fn regs(&self) -> Vec<f64> {
        candidate_regs(&self.config, -2..=3)
    }

    pub fn run(&self) -> Result<EvalReport> {
        let config = &self.config;
        info!(
            model = %config.classifier_name(),
            kfold = config.kfold,
            "training with nested k-fold cross-validation"
        );

        let regs = self.regs();
        let outer = stratified_kfold(self.data.labels(), config.kfold, INNER_FOLD_SEED)?;
        let mut dev_results = Vec::with_capacity(outer.len());
        let mut test_results = Vec::with_capacity(outer.len());

        for (fold_idx, fold) in outer.iter().enumerate() {
            let train = self.data.subset(&fold.train);
            let test = self.data.subset(&fold.test);
            let inner = stratified_kfold(train.labels(), config.kfold, INNER_FOLD_SEED)?;

            let (reg, dev) =
                grid_search(&regs, |reg| cross_validate(config, &train, &inner, reg))?;
            info!(fold = fold_idx + 1, reg, dev, "best regularisation");

            let mut clf = config.build_classifier(train.dim(), reg)?;
            clf.fit(&train, Holdout::Split(RETRAIN_VALIDATION_SPLIT))?;
            let test_accuracy = round2(100.0 * f64::from(clf.score(&test)?));
            debug!(fold = fold_idx + 1, test_accuracy, "outer fold scored");

            dev_results.push(dev);
            test_results.push(test_accuracy);
        }

        let report = EvalReport {
            dev_accuracy: round2(mean(&dev_results)),
            test_accuracy: round2(mean(&test_results)),
        };
        info!(
            dev = report.dev_accuracy,
            test = report.test_accuracy,
            "nested k-fold finished"
        );
        Ok(report)
    }
}

/// K-fold search on a training set, then evaluation on a separate test set.
#[derive(Debug, Clone)]
pub struct KFoldClassifier<'a> {
    train: &'a Dataset,
    test: &'a Dataset,
    config: EvalConfig,
}

impl<'a> KFoldClassifier<'a> {
    pub fn new(train: &'a Dataset, test: &'a Dataset, config: EvalConfig) -> Result<Self> {
        check_inputs(&config, &[("train", train), ("test", test)])?;
        Ok(Self {
            train,
            test,
            config,
        })
    }

    pub fn regs(&self) -> Vec<f64> {
        candidate_regs(&self.config, -1..=5)
    }

    pub fn run(&self) -> Result<KFoldReport> {
        let config = &self.config;
        info!(
            model = %config.classifier_name(),
            kfold = config.kfold,
            "training with k-fold cross-validation"
        );

        let folds = stratified_kfold(self.train.labels(), config.kfold, config.seed)?;
        let (reg, dev) = grid_search(&self.regs(), |reg| {
            cross_validate(config, self.train, &folds, reg)
        })?;
        info!(reg, dev, "best regularisation");

        let mut clf = config.build_classifier(self.train.dim(), reg)?;
        clf.fit(self.train, Holdout::Split(RETRAIN_VALIDATION_SPLIT))?;
        let test_accuracy = round2(100.0 * f64::from(clf.score(self.test)?));
        let predictions = clf.predict(self.test.features())?;
        info!(dev, test = test_accuracy, "k-fold finished");

        Ok(KFoldReport {
            dev_accuracy: dev,
            test_accuracy,
            predictions,
        })
    }
}

/// Search on a fixed validation set, then evaluation on a separate test set.
#[derive(Debug, Clone)]
pub struct SplitClassifier<'a> {
    train: &'a Dataset,
    valid: &'a Dataset,
    test: &'a Dataset,
    config: EvalConfig,
}

impl<'a> SplitClassifier<'a> {
    pub fn new(
        train: &'a Dataset,
        valid: &'a Dataset,
        test: &'a Dataset,
        config: EvalConfig,
    ) -> Result<Self> {
        check_inputs(
            &config,
            &[("train", train), ("valid", valid), ("test", test)],
        )?;
        Ok(Self {
            train,
            valid,
            test,
            config,
        })
    }

    /// With `noreg` this is a single, effectively unregularised value.
    pub fn regs(&self) -> Vec<f64> {
        match (self.config.noreg, self.config.usepytorch) {
            (true, true) => vec![NOREG_MLP],
            (true, false) => vec![NOREG_LOGREG],
            (false, _) => candidate_regs(&self.config, -2..=3),
        }
    }

    fn train_and_score(&self, reg: f64, eval: &Dataset) -> Result<f64> {
        let mut clf = self.config.build_classifier(self.train.dim(), reg)?;
        clf.fit(self.train, Holdout::Data(self.valid))?;
        Ok(round2(100.0 * f64::from(clf.score(eval)?)))
    }

    pub fn run(&self) -> Result<EvalReport> {
        info!(
            model = %self.config.classifier_name(),
            noreg = self.config.noreg,
            "training with a fixed train/valid/test split"
        );

        let (reg, dev) = grid_search(&self.regs(), |reg| self.train_and_score(reg, self.valid))?;
        info!(reg, dev, "best regularisation");

        let test_accuracy = self.train_and_score(reg, self.test)?;
        info!(dev, test = test_accuracy, "split evaluation finished");
        Ok(EvalReport {
            dev_accuracy: dev,
            test_accuracy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_best_prefers_first_of_ties() {
        assert_eq!(select_best(&[71.5, 80.25, 80.25, 79.0]), Some((1, 80.25)));
        assert_eq!(select_best(&[50.0]), Some((0, 50.0)));
        assert_eq!(select_best(&[]), None);
    }

    #[test]
    fn grids_depend_on_backend_and_strategy() {
        let data = Dataset::from_flat(vec![0.0; 10], 1, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1]).unwrap();

        let mlp = EvalConfig::default();
        let nested = InnerKFoldClassifier::new(&data, mlp.clone()).unwrap();
        let expected = [1e-5, 1e-4, 1e-3, 1e-2];
        for (got, want) in nested.regs().iter().zip(expected) {
            assert!((got - want).abs() < want * 1e-12, "{got} vs {want}");
        }
        assert_eq!(nested.regs().len(), expected.len());

        let logreg = EvalConfig {
            usepytorch: false,
            ..EvalConfig::default()
        };
        let nested = InnerKFoldClassifier::new(&data, logreg.clone()).unwrap();
        assert_eq!(nested.regs(), vec![0.25, 0.5, 1.0, 2.0, 4.0, 8.0]);
        let kfold = KFoldClassifier::new(&data, &data, logreg.clone()).unwrap();
        assert_eq!(kfold.regs(), vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0]);
        let kfold = KFoldClassifier::new(&data, &data, mlp.clone()).unwrap();
        assert_eq!(kfold.regs().len(), 4);
    }

    #[test]
    fn noreg_uses_a_single_extreme_candidate() {
        let data = Dataset::from_flat(vec![0.0; 4], 1, vec![0, 1, 0, 1]).unwrap();
        let mut config = EvalConfig {
            noreg: true,
            ..EvalConfig::default()
        };
        let split = SplitClassifier::new(&data, &data, &data, config.clone()).unwrap();
        assert_eq!(split.regs(), vec![1e-9]);

        config.usepytorch = false;
        let split = SplitClassifier::new(&data, &data, &data, config).unwrap();
        assert_eq!(split.regs(), vec![1e9]);
    }

    #[test]
    fn grid_search_reports_the_winner() {
        let regs = [0.1, 0.2, 0.3];
        let mut seen = Vec::new();
        let (reg, score) = grid_search(&regs, |reg| {
            seen.push(reg);
            Ok(if reg == 0.2 { 90.0 } else { 60.0 })
        })
        .unwrap();
        assert_eq!((reg, score), (0.2, 90.0));
        assert_eq!(seen, regs);
    }

    #[test]
    fn constructors_validate_inputs() {
        let data = Dataset::from_flat(vec![0.0; 4], 2, vec![0, 1]).unwrap();
        let other = Dataset::from_flat(vec![0.0; 3], 3, vec![0]).unwrap();
        assert!(matches!(
            KFoldClassifier::new(&data, &other, EvalConfig::default()),
            Err(Error::InvalidShape(_))
        ));

        let bad_labels = Dataset::from_flat(vec![0.0; 2], 2, vec![5]).unwrap();
        assert!(matches!(
            InnerKFoldClassifier::new(&bad_labels, EvalConfig::default()),
            Err(Error::InvalidData(_))
        ));
    }
}
