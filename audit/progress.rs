use crate::train::{EpochRecord, PassSummary};
use std::fmt;
use std::path::Path;

/// Kinds of batch passes reported during training and evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    Train,
    Validation,
    Test,
}

impl PassKind {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Train => "training",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress of the k-fold loop.
pub trait TrainingObserver {
    fn on_fold_start(&mut self, fold: usize, num_folds: usize, train_size: usize, val_size: usize) {
        let _ = (fold, num_folds, train_size, val_size);
    }
    fn on_pass_start(&mut self, kind: PassKind, num_batches: usize) {
        let _ = (kind, num_batches);
    }
    fn on_batch(&mut self, kind: PassKind, processed_batches: usize) {
        let _ = (kind, processed_batches);
    }
    fn on_pass_finish(&mut self, kind: PassKind, summary: &PassSummary) {
        let _ = (kind, summary);
    }
    fn on_epoch_end(&mut self, fold: usize, record: &EpochRecord) {
        let _ = (fold, record);
    }
    fn on_checkpoint(&mut self, fold: usize, epoch: usize, score: f64, path: &Path) {
        let _ = (fold, epoch, score, path);
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl TrainingObserver for NoopProgress {}
