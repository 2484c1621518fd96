#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use candle_core::Device;
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use clinfair::config::{
    OptimizerScope, RUN_CONFIG_FILE, SelectionMetric, TEST_FEATURES_FILE, TEST_LABELS_FILE,
    TRAIN_FEATURES_FILE, TRAIN_LABELS_FILE, TrainConfig, next_experiment_dir,
};
use clinfair::data::{DemographicBaseline, PredictionTable, SequenceDataset};
use clinfair::fairness::{Attribute, audit_all};
use clinfair::heads::Head;
use clinfair::metrics::{DEFAULT_CALIBRATION_BINS, DEFAULT_THRESHOLD, MetricOptions};
use clinfair::model::ModelConfig;
use clinfair::progress::{PassKind, TrainingObserver};
use clinfair::report::{ReportRenderer, TsvReportWriter};
use clinfair::train::{EpochRecord, PassSummary, run_k_fold, test_checkpoint};

#[derive(Args)]
pub struct MetricArgs {
    /// Probability above which a prediction counts as positive
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f64,

    /// Number of uniform bins for calibration curves
    #[arg(long, default_value_t = DEFAULT_CALIBRATION_BINS)]
    pub calibration_bins: usize,
}

impl MetricArgs {
    fn options(&self) -> MetricOptions {
        MetricOptions {
            threshold: self.threshold,
            calibration_bins: self.calibration_bins,
        }
    }
}

#[derive(Args)]
pub struct TrainArgs {
    /// Directory holding the training .npy files
    #[arg(long, default_value = "../data_npy")]
    pub data_dir: PathBuf,

    /// Feature array file name inside the data directory
    #[arg(long, default_value = TRAIN_FEATURES_FILE)]
    pub features_file: String,

    /// Label array file name inside the data directory
    #[arg(long, default_value = TRAIN_LABELS_FILE)]
    pub labels_file: String,

    /// Root of the experiment tree; runs go to <OUTPUT_DIR>/train/exp<N>
    #[arg(long, default_value = "./output_new")]
    pub output_dir: PathBuf,

    /// CUDA device ordinal, or "cpu"
    #[arg(long, default_value = "0")]
    pub device: String,

    #[arg(long, default_value = "100")]
    pub epochs: usize,

    /// Learning rate
    #[arg(long, default_value = "1e-3")]
    pub lr: f64,

    #[arg(long, default_value = "512")]
    pub batch_size: usize,

    /// Number of stratified folds
    #[arg(long, default_value = "5")]
    pub folds: usize,

    /// Seed for fold assignment and batch shuffling
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Head whose labels stratify the folds
    #[arg(long, value_enum, default_value_t = Head::HospitalMortality)]
    pub stratify_on: Head,

    /// Number of input features per time step
    #[arg(long, default_value = "12")]
    pub input_size: usize,

    #[arg(long, default_value = "128")]
    pub hidden_size: usize,

    /// Number of stacked LSTM layers
    #[arg(long, default_value = "2")]
    pub num_layers: usize,

    /// Use a bidirectional LSTM
    #[arg(long)]
    pub bidirectional: bool,

    /// Parameters updated by the optimiser
    #[arg(long, value_enum, default_value_t = OptimizerScope::ModelOnly)]
    pub optimizer_scope: OptimizerScope,

    /// Checkpoint selection metric: acc:<head>, auc:<head>, f1:<head> or loss
    #[arg(long, default_value = "acc:icu")]
    pub select: SelectionMetric,

    #[command(flatten)]
    pub metrics: MetricArgs,
}

#[derive(Args)]
pub struct TestArgs {
    /// Checkpoint to evaluate; model.toml must sit next to it
    #[arg(long)]
    pub weight: PathBuf,

    /// Directory holding the test .npy files
    #[arg(long, default_value = "../data_npy")]
    pub data_dir: PathBuf,

    #[arg(long, default_value = TEST_FEATURES_FILE)]
    pub features_file: String,

    #[arg(long, default_value = TEST_LABELS_FILE)]
    pub labels_file: String,

    /// Root of the experiment tree; runs go to <OUTPUT_DIR>/test/exp<N>
    #[arg(long, default_value = "./output_new")]
    pub output_dir: PathBuf,

    /// CUDA device ordinal, or "cpu"
    #[arg(long, default_value = "0")]
    pub device: String,

    #[arg(long, default_value = "512")]
    pub batch_size: usize,

    /// Write the prediction table to result.csv
    #[arg(long)]
    pub save_results: bool,

    #[command(flatten)]
    pub metrics: MetricArgs,
}

#[derive(Args)]
pub struct FairnessArgs {
    /// Prediction table written by `test --save-results`
    #[arg(long)]
    pub predictions: PathBuf,

    /// Demographic baseline CSV with stay_id, race, gender, insurance, admission_type
    #[arg(long)]
    pub baseline: PathBuf,

    /// Directory that receives fairness/<attribute>/; defaults to the prediction table's directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Attributes to audit (repeatable); all of them when omitted
    #[arg(long = "attribute", value_enum)]
    pub attributes: Vec<Attribute>,

    #[command(flatten)]
    pub metrics: MetricArgs,
}

#[derive(Parser)]
#[command(
    name = "clinfair",
    about = "Multi-task ICU mortality modelling and demographic fairness auditing",
    long_about = "Trains a multi-head recurrent model on ICU time series with stratified k-fold \
                 cross-validation, evaluates checkpoints on held-out stays, and audits the \
                 resulting predictions per demographic subgroup."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train one model per stratified fold
    Train(TrainArgs),
    /// Evaluate a checkpoint on the test split
    Test(TestArgs),
    /// Audit a prediction table per demographic subgroup
    Fairness(FairnessArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Test(args)) => test(args),
        Some(Commands::Fairness(args)) => fairness(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = TrainConfig {
        epochs: args.epochs,
        learning_rate: args.lr,
        batch_size: args.batch_size,
        folds: args.folds,
        seed: args.seed,
        stratify_on: args.stratify_on,
        optimizer_scope: args.optimizer_scope,
        selection: args.select,
        metrics: args.metrics.options(),
        model: ModelConfig {
            input_size: args.input_size,
            hidden_size: args.hidden_size,
            num_layers: args.num_layers,
            bidirectional: args.bidirectional,
        },
    };
    config.validate()?;
    config.model.validate()?;

    let device = select_device(&args.device)?;
    let dataset = SequenceDataset::load_npy(
        &args.data_dir.join(&args.features_file),
        &args.data_dir.join(&args.labels_file),
    )?;

    let exp_dir = next_experiment_dir(&args.output_dir, "train")?;
    config.save(&exp_dir.join(RUN_CONFIG_FILE))?;
    println!("Experiment directory: {}", exp_dir.display());

    let mut observer = BarObserver::default();
    let mut renderer = TsvReportWriter::new(&exp_dir);
    let reports = run_k_fold(&dataset, &config, &device, &exp_dir, &mut observer, &mut renderer)?;

    for report in &reports {
        match (&report.checkpoint, report.best_epoch) {
            (Some(path), Some(epoch)) => println!(
                "Fold {}: best {} = {:.4} at epoch {} -> {}",
                report.fold,
                config.selection,
                report.best_score,
                epoch,
                path.display()
            ),
            _ => println!("Fold {}: no checkpoint written", report.fold),
        }
    }
    Ok(())
}

pub fn test(args: TestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.metrics.options();
    let device = select_device(&args.device)?;
    let dataset = SequenceDataset::load_npy(
        &args.data_dir.join(&args.features_file),
        &args.data_dir.join(&args.labels_file),
    )?;

    let exp_dir = next_experiment_dir(&args.output_dir, "test")?;
    println!("Experiment directory: {}", exp_dir.display());

    let mut observer = BarObserver::default();
    let mut renderer = TsvReportWriter::new(&exp_dir);
    let record = test_checkpoint(
        &args.weight,
        &dataset,
        args.batch_size,
        &options,
        &device,
        &exp_dir,
        args.save_results,
        &mut observer,
        &mut renderer,
    )?;

    println!(
        "Test loss: {:.4}, accuracy hosp: {:.4}, icu: {:.4}, 24hr_die: {:.4}, 24hr_alive: {:.4}",
        record.summary.loss,
        record.summary.accuracy(Head::HospitalMortality),
        record.summary.accuracy(Head::IcuMortality),
        record.summary.accuracy(Head::DieWithin24h),
        record.summary.accuracy(Head::LeaveIcuWithin24h),
    );
    Ok(())
}

pub fn fairness(args: FairnessArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.metrics.options();
    let attributes = if args.attributes.is_empty() {
        Attribute::ALL.to_vec()
    } else {
        args.attributes.clone()
    };

    let predictions = PredictionTable::load_csv(&args.predictions)?;
    let baseline = DemographicBaseline::load_csv(&args.baseline)?;
    println!(
        "Loaded {} predictions and {} baseline rows",
        predictions.len(),
        baseline.len()
    );

    let output_dir = match &args.output_dir {
        Some(dir) => dir.clone(),
        None => args
            .predictions
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let mut renderer = TsvReportWriter::new(&output_dir);

    let reports = audit_all(&predictions, &baseline, &attributes, &options)?;
    for report in &reports {
        renderer.render_fairness(report)?;
        println!("{}:", report.attribute);
        for bucket in &report.buckets {
            println!("  {} ({} stays)", bucket.label, bucket.len());
            for m in &bucket.metrics {
                println!("    {}: {}", m.head, m.result);
            }
        }
    }
    println!(
        "Fairness reports written to {}",
        output_dir.join("fairness").display()
    );
    Ok(())
}

fn select_device(device: &str) -> Result<Device, Box<dyn std::error::Error>> {
    if device.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }
    let ordinal: usize = device
        .parse()
        .map_err(|_| format!("device must be a CUDA ordinal or 'cpu', got '{device}'"))?;
    let device = Device::cuda_if_available(ordinal)?;
    if device.is_cpu() {
        log::info!("CUDA is not available; running on the CPU");
    }
    Ok(device)
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Drives one progress bar per batch pass.
#[derive(Default)]
struct BarObserver {
    fold: usize,
    bar: Option<ProgressBar>,
}

impl TrainingObserver for BarObserver {
    fn on_fold_start(&mut self, fold: usize, num_folds: usize, train_size: usize, val_size: usize) {
        self.fold = fold;
        log::info!(
            "Fold {}/{}: {} training and {} validation records",
            fold + 1,
            num_folds,
            train_size,
            val_size
        );
    }

    fn on_pass_start(&mut self, kind: PassKind, num_batches: usize) {
        let message = match kind {
            PassKind::Test => kind.describe().to_string(),
            _ => format!("fold {} {}", self.fold, kind),
        };
        self.bar = Some(create_progress_bar(num_batches as u64, &message));
    }

    fn on_batch(&mut self, _kind: PassKind, processed_batches: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_batches as u64);
        }
    }

    fn on_pass_finish(&mut self, _kind: PassKind, _summary: &PassSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_epoch_end(&mut self, fold: usize, record: &EpochRecord) {
        if record.improved {
            log::debug!("Fold {fold}: epoch {} improved the selection score", record.epoch);
        }
    }

    fn on_checkpoint(&mut self, fold: usize, epoch: usize, score: f64, path: &Path) {
        log::info!(
            "Fold {fold}: saved checkpoint at epoch {epoch} (score {score:.4}) to {}",
            path.display()
        );
    }
}
