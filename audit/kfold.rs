//! # Stratified K-Fold Partitioning
//!
//! Splits record indices into `k` folds whose class proportions match the
//! whole dataset. Each class is shuffled with a seeded ChaCha stream and its
//! members are dealt round-robin onto the folds, continuing where the
//! previous class stopped. As a result:
//!
//! - every index appears in exactly one validation set,
//! - per-class counts differ by at most one between folds,
//! - fold sizes differ by at most one.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FoldError {
    #[error("At least 2 folds are required, but {0} was requested.")]
    InvalidFoldCount(usize),
    #[error("Cannot split {samples} records into {k} folds.")]
    TooFewSamples { k: usize, samples: usize },
}

/// One train/validation partition of the record indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train_index: Vec<usize>,
    pub val_index: Vec<usize>,
}

/// Stratified, shuffled k-fold split over `labels` (one class label per record).
///
/// Both index lists of every fold are sorted ascending.
pub fn stratified_k_fold(labels: &[u8], k: usize, seed: u64) -> Result<Vec<Fold>, FoldError> {
    if k < 2 {
        return Err(FoldError::InvalidFoldCount(k));
    }
    if k > labels.len() {
        return Err(FoldError::TooFewSamples {
            k,
            samples: labels.len(),
        });
    }

    let mut by_class: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignment = vec![0usize; labels.len()];
    let mut cursor = 0usize;
    for (class, members) in by_class.iter_mut() {
        if members.len() < k {
            log::warn!(
                "Class {} has only {} members, fewer than the {} folds; some folds will not contain it",
                class,
                members.len(),
                k
            );
        }
        members.shuffle(&mut rng);
        for &index in members.iter() {
            assignment[index] = cursor % k;
            cursor += 1;
        }
    }

    let folds = (0..k)
        .map(|fold| {
            let (val_index, train_index): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| assignment[i] == fold);
            Fold {
                train_index,
                val_index,
            }
        })
        .collect();
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imbalanced(n: usize) -> Vec<u8> {
        (0..n).map(|i| u8::from(i % 7 == 0)).collect()
    }

    #[test]
    fn validation_sets_partition_the_index_set() {
        let labels = imbalanced(103);
        let folds = stratified_k_fold(&labels, 5, 42).unwrap();
        assert_eq!(folds.len(), 5);

        let mut seen = vec![0usize; labels.len()];
        for fold in &folds {
            for &i in &fold.val_index {
                seen[i] += 1;
            }
            assert_eq!(fold.train_index.len() + fold.val_index.len(), labels.len());
            assert!(fold.train_index.iter().all(|i| !fold.val_index.contains(i)));
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn class_counts_are_balanced_across_folds() {
        let labels = imbalanced(103);
        let folds = stratified_k_fold(&labels, 5, 7).unwrap();
        let positives: Vec<usize> = folds
            .iter()
            .map(|f| f.val_index.iter().filter(|&&i| labels[i] == 1).count())
            .collect();
        let sizes: Vec<usize> = folds.iter().map(|f| f.val_index.len()).collect();

        let spread = |v: &[usize]| v.iter().max().unwrap() - v.iter().min().unwrap();
        assert!(spread(&positives) <= 1, "positives per fold: {positives:?}");
        assert!(spread(&sizes) <= 1, "fold sizes: {sizes:?}");
        assert_eq!(positives.iter().sum::<usize>(), labels.iter().filter(|&&l| l == 1).count());
    }

    #[test]
    fn same_seed_gives_same_folds() {
        let labels = imbalanced(50);
        let a = stratified_k_fold(&labels, 5, 3).unwrap();
        let b = stratified_k_fold(&labels, 5, 3).unwrap();
        let c = stratified_k_fold(&labels, 5, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_degenerate_fold_counts() {
        assert_eq!(stratified_k_fold(&[0, 1, 0], 1, 0), Err(FoldError::InvalidFoldCount(1)));
        assert_eq!(
            stratified_k_fold(&[0, 1, 0], 4, 0),
            Err(FoldError::TooFewSamples { k: 4, samples: 3 })
        );
    }

    #[test]
    fn rare_class_still_yields_k_folds() {
        let mut labels = vec![0u8; 20];
        labels[3] = 1;
        labels[11] = 1;
        let folds = stratified_k_fold(&labels, 5, 0).unwrap();
        let holding_positive = folds
            .iter()
            .filter(|f| f.val_index.iter().any(|&i| labels[i] == 1))
            .count();
        assert_eq!(holding_positive, 2);
        assert!(folds.iter().all(|f| !f.val_index.is_empty()));
    }
}
