//! Stratified k-fold splitting.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::{Error, Result};

/// One train/test split of a k-fold partition. Both index lists are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partition `0..labels.len()` into `k` folds that preserve class proportions.
///
/// Each class's indices are shuffled with an RNG seeded by `seed` and dealt
/// round-robin into the folds. The dealing cursor carries over from one class
/// to the next, so fold sizes differ by at most one. Every index appears in
/// exactly one test set.
pub fn stratified_kfold(labels: &[usize], k: usize, seed: u64) -> Result<Vec<Fold>> {
    if k < 2 {
        return Err(Error::Stratification(format!("k must be >= 2, got {k}")));
    }

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(idx);
    }
    if let Some((class, members)) = by_class.iter().find(|(_, members)| members.len() < k) {
        return Err(Error::Stratification(format!(
            "class {class} has {} members, fewer than {k} folds",
            members.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut tests: Vec<Vec<usize>> = vec![Vec::with_capacity(labels.len() / k + 1); k];
    let mut cursor = 0;
    for members in by_class.values_mut() {
        members.shuffle(&mut rng);
        for &idx in members.iter() {
            tests[cursor].push(idx);
            cursor = (cursor + 1) % k;
        }
    }

    let mut fold_of = vec![0_usize; labels.len()];
    for (fold, test) in tests.iter_mut().enumerate() {
        test.sort_unstable();
        for &idx in test.iter() {
            fold_of[idx] = fold;
        }
    }

    Ok(tests
        .into_iter()
        .enumerate()
        .map(|(fold, test)| Fold {
            train: (0..labels.len()).filter(|&idx| fold_of[idx] != fold).collect(),
            test,
        })
        .collect())
}
