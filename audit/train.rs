//! # K-Fold Training Loop
//!
//! Drives the multi-head sequence model through stratified k-fold training
//! and evaluates saved checkpoints on held-out data.
//!
//! Each fold starts from fresh parameters, a fresh loss and a fresh
//! optimiser. An epoch is one shuffled training pass with updates followed by
//! one ordered validation pass without updates. After every validation pass
//! the configured [`SelectionMetric`] is scored and the fold checkpoint is
//! overwritten only on a strict improvement. Folds run one after another and
//! nothing but the fold report outlives a fold.

use crate::aggregate::{AggregateError, AggregatedPass, PredictionAggregator};
use crate::config::{ConfigError, SelectionMetric, TrainConfig};
use crate::data::{DataError, PredictionTable, SequenceDataset, labels_to_tensor};
use crate::heads::Head;
use crate::kfold::{FoldError, stratified_k_fold};
use crate::metrics::{self, HeadMetrics, MetricOptions, MetricValue, MetricsError};
use crate::model::{
    ModelError, MultiHeadSequenceModel, WeightedMultiHeadLoss, build_trainable, load_checkpoint,
    save_checkpoint,
};
use crate::progress::{PassKind, TrainingObserver};
use crate::report::{ReportError, ReportRenderer};
use candle_core::{Device, Module};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of a fold's best checkpoint.
pub const CHECKPOINT_FILE: &str = "best.safetensors";

/// File name of the persisted prediction table.
pub const RESULTS_FILE: &str = "result.csv";

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Folds(#[from] FoldError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("Metric computation failed: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Report rendering failed: {0}")]
    Report(#[from] ReportError),
    #[error("Tensor operation failed: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ========================================================================================
//                                    HISTORY RECORDS
// ========================================================================================

/// Loss and per-head accuracy of one pass over a split.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub kind: PassKind,
    pub records: usize,
    pub batches: usize,
    /// Mean of the per-batch losses; undefined for an empty pass.
    pub loss: MetricValue,
    /// Accuracy per active head, in [`Head::ACTIVE`] order.
    pub accuracy: [MetricValue; 4],
}

impl PassSummary {
    pub fn accuracy(&self, head: Head) -> MetricValue {
        Head::ACTIVE
            .iter()
            .position(|&h| h == head)
            .map_or(MetricValue::Undefined, |i| self.accuracy[i])
    }
}

/// One epoch of one fold.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    /// 1-based.
    pub epoch: usize,
    pub train: PassSummary,
    pub validation: PassSummary,
    /// Empty when the validation pass produced non-finite predictions.
    pub validation_metrics: Vec<HeadMetrics>,
    /// Aggregated arrays of the shuffled training pass, in visiting order.
    pub train_pass: AggregatedPass,
    /// Aggregated arrays of the validation pass, in record order.
    pub validation_pass: AggregatedPass,
    /// Selection score, oriented so that larger is better.
    pub score: MetricValue,
    /// Whether this epoch replaced the checkpoint.
    pub improved: bool,
}

/// Everything a fold leaves behind.
#[derive(Debug, Clone)]
pub struct FoldReport {
    pub fold: usize,
    pub dir: PathBuf,
    pub train_size: usize,
    pub val_size: usize,
    pub history: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_score: MetricValue,
    pub checkpoint: Option<PathBuf>,
    pub loss_weights: Vec<f32>,
}

impl FoldReport {
    /// Metric batteries of the final epoch.
    pub fn final_metrics(&self) -> &[HeadMetrics] {
        self.history
            .last()
            .map(|record| record.validation_metrics.as_slice())
            .unwrap_or(&[])
    }

    /// Validation arrays of the final epoch.
    pub fn final_validation(&self) -> Option<&AggregatedPass> {
        self.history.last().map(|record| &record.validation_pass)
    }
}

/// A single evaluation pass over a test set.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub checkpoint: PathBuf,
    pub summary: PassSummary,
    pub metrics: Vec<HeadMetrics>,
    pub pass: AggregatedPass,
}

// ========================================================================================
//                                  CHECKPOINT SELECTION
// ========================================================================================

/// Scores a validation pass; the loss is negated so that larger is always better.
pub fn selection_score(
    metric: SelectionMetric,
    summary: &PassSummary,
    metrics: &[HeadMetrics],
) -> MetricValue {
    let battery = |head: Head| metrics.iter().find(|m| m.head == head).map(|m| &m.result);
    match metric {
        SelectionMetric::Accuracy(head) => summary.accuracy(head),
        SelectionMetric::Auc(head) => battery(head).map_or(MetricValue::Undefined, |r| r.auc),
        SelectionMetric::F1(head) => battery(head).map_or(MetricValue::Undefined, |r| r.f1),
        SelectionMetric::Loss => match summary.loss {
            MetricValue::Defined(loss) => MetricValue::Defined(-loss),
            MetricValue::Undefined => MetricValue::Undefined,
        },
    }
}

/// Tracks the best score of a fold.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestCheckpoint {
    best: Option<f64>,
}

impl BestCheckpoint {
    pub fn best(&self) -> MetricValue {
        self.best.map_or(MetricValue::Undefined, MetricValue::Defined)
    }

    /// Records `score` and returns whether it strictly beats every earlier
    /// score. Ties and undefined scores never win.
    pub fn offer(&mut self, score: MetricValue) -> bool {
        let MetricValue::Defined(value) = score else {
            return false;
        };
        if value.is_nan() {
            return false;
        }
        match self.best {
            Some(best) if value <= best => false,
            _ => {
                self.best = Some(value);
                true
            }
        }
    }
}

// ========================================================================================
//                                        PASSES
// ========================================================================================

struct PassContext<'a> {
    model: &'a MultiHeadSequenceModel,
    loss: &'a WeightedMultiHeadLoss,
    device: &'a Device,
    batch_size: usize,
    threshold: f64,
}

/// Runs the model over `order` in batches. With an optimiser every batch is
/// followed by a parameter update.
fn run_pass(
    ctx: &PassContext<'_>,
    dataset: &SequenceDataset,
    order: &[usize],
    kind: PassKind,
    mut optimizer: Option<(&mut AdamW, bool)>,
    observer: &mut dyn TrainingObserver,
) -> Result<(PassSummary, AggregatedPass), TrainingError> {
    let num_batches = order.len().div_ceil(ctx.batch_size);
    observer.on_pass_start(kind, num_batches);

    let mut aggregator = PredictionAggregator::new();
    let mut loss_sum = 0.0;
    for (b, chunk) in order.chunks(ctx.batch_size).enumerate() {
        let (inputs, targets) = dataset.batch(chunk, ctx.device)?;
        let outputs = ctx.model.forward(&inputs)?;
        let loss = ctx.loss.compute(&outputs, &labels_to_tensor(targets.view(), ctx.device)?)?;

        if let Some((optimizer, clamp_weights)) = optimizer.as_mut() {
            optimizer.backward_step(&loss)?;
            if *clamp_weights {
                ctx.loss.clamp_non_negative()?;
            }
        }

        loss_sum += f64::from(loss.to_scalar::<f32>()?);
        aggregator.push_tensors(&outputs, targets.view())?;
        observer.on_batch(kind, b + 1);
    }

    let pass = aggregator.snapshot()?;
    let mean_loss = loss_sum / num_batches as f64;
    let summary = PassSummary {
        kind,
        records: pass.len(),
        batches: num_batches,
        loss: if num_batches == 0 || !mean_loss.is_finite() {
            MetricValue::Undefined
        } else {
            MetricValue::Defined(mean_loss)
        },
        accuracy: pass_accuracy(&pass, ctx.threshold, kind)?,
    };
    observer.on_pass_finish(kind, &summary);
    Ok((summary, pass))
}

/// Per-head accuracy of a pass. A head with a non-finite prediction is
/// undefined for the pass instead of failing the run.
fn pass_accuracy(
    pass: &AggregatedPass,
    threshold: f64,
    kind: PassKind,
) -> Result<[MetricValue; 4], MetricsError> {
    let mut accuracy = [MetricValue::Undefined; 4];
    for (slot, head) in accuracy.iter_mut().zip(Head::ACTIVE) {
        match metrics::confusion_matrix(pass.truth(head), pass.predicted(head), threshold) {
            Ok(confusion) => *slot = confusion.accuracy(),
            Err(MetricsError::NonFinitePrediction { index, value }) => {
                log::warn!(
                    "{kind} pass: {head} prediction at row {index} is {value}; accuracy is undefined"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(accuracy)
}

/// Metric batteries of one validation pass. A diverged epoch yields no
/// batteries, so every score drawn from them is undefined.
fn validation_batteries(
    pass: &AggregatedPass,
    options: &MetricOptions,
    fold: usize,
    epoch: usize,
) -> Result<Vec<HeadMetrics>, MetricsError> {
    match pass.evaluate_active(options) {
        Ok(batteries) => Ok(batteries),
        Err(MetricsError::NonFinitePrediction { index, value }) => {
            log::warn!(
                "Fold {fold} epoch {epoch}: validation prediction at row {index} is {value}; metrics are undefined for this epoch"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

// ========================================================================================
//                                       K-FOLD LOOP
// ========================================================================================

/// Trains one model per stratified fold under `exp_dir/fold{i}` and hands each
/// fold report to `renderer` as soon as the fold finishes.
pub fn run_k_fold(
    dataset: &SequenceDataset,
    config: &TrainConfig,
    device: &Device,
    exp_dir: &Path,
    observer: &mut dyn TrainingObserver,
    renderer: &mut dyn ReportRenderer,
) -> Result<Vec<FoldReport>, TrainingError> {
    config.validate()?;
    if dataset.num_features() != config.model.input_size {
        return Err(ModelError::MismatchedFeatureCount {
            found: dataset.num_features(),
            expected: config.model.input_size,
        }
        .into());
    }

    let folds = stratified_k_fold(
        &dataset.class_labels(config.stratify_on),
        config.folds,
        config.seed,
    )?;
    log::info!(
        "Training {} folds for {} epochs on {} records (stratified on {})",
        folds.len(),
        config.epochs,
        dataset.len(),
        config.stratify_on
    );

    let mut reports = Vec::with_capacity(folds.len());
    for (i, fold) in folds.iter().enumerate() {
        let fold_dir = exp_dir.join(format!("fold{i}"));
        fs::create_dir_all(&fold_dir)?;
        observer.on_fold_start(i, folds.len(), fold.train_index.len(), fold.val_index.len());

        let train_set = dataset.subset(&fold.train_index);
        let val_set = dataset.subset(&fold.val_index);
        let report = train_fold(i, &train_set, &val_set, config, device, &fold_dir, observer)?;
        renderer.render_fold(&report)?;
        reports.push(report);
    }
    Ok(reports)
}

fn train_fold(
    fold: usize,
    train_set: &SequenceDataset,
    val_set: &SequenceDataset,
    config: &TrainConfig,
    device: &Device,
    fold_dir: &Path,
    observer: &mut dyn TrainingObserver,
) -> Result<FoldReport, TrainingError> {
    let (varmap, model) = build_trainable(config.model, device)?;
    let loss = WeightedMultiHeadLoss::new(device)?;

    let mut vars = varmap.all_vars();
    let clamp_weights = config.optimizer_scope.includes_loss_weights();
    if clamp_weights {
        vars.push(loss.var().clone());
    }
    let mut optimizer = AdamW::new(
        vars,
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let ctx = PassContext {
        model: &model,
        loss: &loss,
        device,
        batch_size: config.batch_size,
        threshold: config.metrics.threshold,
    };
    let checkpoint_path = fold_dir.join(CHECKPOINT_FILE);
    let val_order: Vec<usize> = (0..val_set.len()).collect();
    let mut train_order: Vec<usize> = (0..train_set.len()).collect();
    let mut best = BestCheckpoint::default();
    let mut best_epoch = None;
    let mut history: Vec<EpochRecord> = Vec::with_capacity(config.epochs);

    for epoch in 0..config.epochs {
        let mut rng = ChaCha8Rng::seed_from_u64(
            config
                .seed
                .wrapping_add((fold * config.epochs + epoch) as u64),
        );
        train_order.shuffle(&mut rng);

        let (train, train_pass) = run_pass(
            &ctx,
            train_set,
            &train_order,
            PassKind::Train,
            Some((&mut optimizer, clamp_weights)),
            observer,
        )?;
        let (validation, val_pass) =
            run_pass(&ctx, val_set, &val_order, PassKind::Validation, None, observer)?;
        let validation_metrics =
            validation_batteries(&val_pass, &config.metrics, fold, epoch + 1)?;

        let score = selection_score(config.selection, &validation, &validation_metrics);
        let improved = best.offer(score);
        if improved {
            save_checkpoint(&varmap, &config.model, &checkpoint_path)?;
            best_epoch = Some(epoch + 1);
            if let MetricValue::Defined(value) = score {
                observer.on_checkpoint(fold, epoch + 1, value, &checkpoint_path);
            }
        }

        log::info!(
            "Fold {} epoch {}/{}: train loss {:.4}, val loss {:.4}, val acc hosp {:.4} icu {:.4} 24hr_die {:.4} 24hr_alive {:.4}{}",
            fold,
            epoch + 1,
            config.epochs,
            train.loss,
            validation.loss,
            validation.accuracy[0],
            validation.accuracy[1],
            validation.accuracy[2],
            validation.accuracy[3],
            if improved { " *" } else { "" }
        );

        let record = EpochRecord {
            epoch: epoch + 1,
            train,
            validation,
            validation_metrics,
            train_pass,
            validation_pass: val_pass,
            score,
            improved,
        };
        observer.on_epoch_end(fold, &record);
        history.push(record);
    }

    if best_epoch.is_none() {
        log::warn!(
            "Fold {fold}: '{}' was never defined on the validation split; no checkpoint was written",
            config.selection
        );
    }

    Ok(FoldReport {
        fold,
        dir: fold_dir.to_path_buf(),
        train_size: train_set.len(),
        val_size: val_set.len(),
        history,
        best_epoch,
        best_score: best.best(),
        checkpoint: best_epoch.map(|_| checkpoint_path),
        loss_weights: loss.weights()?,
    })
}

// ========================================================================================
//                                 CHECKPOINT EVALUATION
// ========================================================================================

/// Runs a saved checkpoint once over `dataset`, in record order, without updates.
pub fn evaluate_checkpoint(
    checkpoint: &Path,
    dataset: &SequenceDataset,
    batch_size: usize,
    options: &MetricOptions,
    device: &Device,
    observer: &mut dyn TrainingObserver,
) -> Result<RunRecord, TrainingError> {
    if batch_size == 0 {
        return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()).into());
    }
    let model = load_checkpoint(checkpoint, device)?;
    if dataset.num_features() != model.config().input_size {
        return Err(ModelError::MismatchedFeatureCount {
            found: dataset.num_features(),
            expected: model.config().input_size,
        }
        .into());
    }
    let loss = WeightedMultiHeadLoss::new(device)?;
    let ctx = PassContext {
        model: &model,
        loss: &loss,
        device,
        batch_size,
        threshold: options.threshold,
    };
    let order: Vec<usize> = (0..dataset.len()).collect();
    let (summary, pass) = run_pass(&ctx, dataset, &order, PassKind::Test, None, observer)?;
    let metrics = pass.evaluate_active(options)?;

    log::info!(
        "Test loss {:.4}, accuracy hosp {:.4} icu {:.4} 24hr_die {:.4} 24hr_alive {:.4}",
        summary.loss,
        summary.accuracy[0],
        summary.accuracy[1],
        summary.accuracy[2],
        summary.accuracy[3]
    );

    Ok(RunRecord {
        checkpoint: checkpoint.to_path_buf(),
        summary,
        metrics,
        pass,
    })
}

/// Evaluates a checkpoint, renders the run and optionally writes `result.csv`
/// into `exp_dir`.
#[allow(clippy::too_many_arguments)]
pub fn test_checkpoint(
    checkpoint: &Path,
    dataset: &SequenceDataset,
    batch_size: usize,
    options: &MetricOptions,
    device: &Device,
    exp_dir: &Path,
    save_results: bool,
    observer: &mut dyn TrainingObserver,
    renderer: &mut dyn ReportRenderer,
) -> Result<RunRecord, TrainingError> {
    let record = evaluate_checkpoint(checkpoint, dataset, batch_size, options, device, observer)?;
    renderer.render_run(&record)?;
    if save_results {
        let table = PredictionTable::from_pass(&record.pass)?;
        let path = exp_dir.join(RESULTS_FILE);
        table.write_csv(&path)?;
        log::info!("Wrote {} predictions to '{}'", table.len(), path.display());
    }
    Ok(record)
}
