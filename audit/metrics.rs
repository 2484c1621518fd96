//! # Metric Battery
//!
//! A pure, deterministic set of binary-classification statistics computed from
//! ground truth and predicted probabilities:
//!
//! - Confusion matrix at an explicit threshold (`y_pred > threshold` is positive).
//! - Sensitivity, specificity, precision, recall, accuracy and F1.
//! - ROC curve over every distinct score and its trapezoidal AUC.
//! - Uniform-bin calibration curve on clipped probabilities.
//!
//! Ratios with a zero denominator are reported as [`MetricValue::Undefined`]
//! instead of failing or defaulting to a number. Small subgroups routinely
//! contain a single class, and a fairness sweep has to survive them.

use crate::heads::Head;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default classification threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Default number of calibration bins.
pub const DEFAULT_CALIBRATION_BINS: usize = 5;

#[derive(Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("y_true has {y_true} entries but y_pred has {y_pred}; they must be the same length.")]
    LengthMismatch { y_true: usize, y_pred: usize },
    #[error("Prediction at position {index} is not finite ({value}).")]
    NonFinitePrediction { index: usize, value: f64 },
    #[error("Calibration curves need at least one bin.")]
    ZeroCalibrationBins,
}

/// A metric that may be undefined for the data it was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Defined(f64),
    /// The denominator was zero, or a required class was absent.
    Undefined,
}

impl MetricValue {
    /// `numerator / denominator`, or `Undefined` when the denominator is zero.
    pub fn ratio(numerator: usize, denominator: usize) -> Self {
        if denominator == 0 {
            MetricValue::Undefined
        } else {
            MetricValue::Defined(numerator as f64 / denominator as f64)
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            MetricValue::Defined(v) => Some(v),
            MetricValue::Undefined => None,
        }
    }

    pub fn is_defined(self) -> bool {
        matches!(self, MetricValue::Defined(_))
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, f.precision()) {
            (MetricValue::Defined(v), Some(p)) => write!(f, "{v:.p$}"),
            (MetricValue::Defined(v), None) => write!(f, "{v}"),
            (MetricValue::Undefined, _) => f.write_str("NA"),
        }
    }
}

/// Options shared by every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricOptions {
    pub threshold: f64,
    pub calibration_bins: usize,
}

impl Default for MetricOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            calibration_bins: DEFAULT_CALIBRATION_BINS,
        }
    }
}

/// Binary confusion matrix, laid out like `confusion_matrix(...).ravel()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tn: usize,
    pub fp: usize,
    pub fn_count: usize,
    pub tp: usize,
}

impl ConfusionMatrix {
    pub fn total(&self) -> usize {
        self.tn + self.fp + self.fn_count + self.tp
    }

    pub fn sensitivity(&self) -> MetricValue {
        MetricValue::ratio(self.tp, self.tp + self.fn_count)
    }

    pub fn specificity(&self) -> MetricValue {
        MetricValue::ratio(self.tn, self.tn + self.fp)
    }

    pub fn precision(&self) -> MetricValue {
        MetricValue::ratio(self.tp, self.tp + self.fp)
    }

    /// Identical to sensitivity; kept separate so reports read naturally.
    pub fn recall(&self) -> MetricValue {
        self.sensitivity()
    }

    pub fn accuracy(&self) -> MetricValue {
        MetricValue::ratio(self.tp + self.tn, self.total())
    }

    pub fn f1(&self) -> MetricValue {
        match (self.precision(), self.recall()) {
            (MetricValue::Defined(p), MetricValue::Defined(r)) if p + r > 0.0 => {
                MetricValue::Defined(2.0 * p * r / (p + r))
            }
            _ => MetricValue::Undefined,
        }
    }
}

/// Receiver operating characteristic curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Decreasing thresholds; the first is `+inf` for the `(0, 0)` point.
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Area under the curve by the trapezoidal rule.
    pub fn auc(&self) -> f64 {
        self.fpr
            .windows(2)
            .zip(self.tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
            .sum()
    }
}

/// One non-empty calibration bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub mean_predicted: f64,
    pub fraction_positive: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub n_bins: usize,
    /// Only bins that received at least one prediction, in increasing order.
    pub bins: Vec<CalibrationBin>,
}

/// The full battery for one `(y_true, y_pred)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    pub n_samples: usize,
    pub n_positive: usize,
    pub confusion: ConfusionMatrix,
    pub sensitivity: MetricValue,
    pub specificity: MetricValue,
    pub precision: MetricValue,
    pub recall: MetricValue,
    pub accuracy: MetricValue,
    pub f1: MetricValue,
    pub auc: MetricValue,
    /// `None` when only one class is present.
    pub roc: Option<RocCurve>,
    pub calibration: CalibrationCurve,
}

impl MetricsResult {
    /// Whether any confusion-derived ratio or the AUC is undefined.
    pub fn has_undefined(&self) -> bool {
        [
            self.sensitivity,
            self.specificity,
            self.precision,
            self.accuracy,
            self.f1,
            self.auc,
        ]
        .iter()
        .any(|m| !m.is_defined())
    }
}

impl fmt::Display for MetricsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sensitivity: {:.2}, specificity: {:.2}, precision: {:.2}, f1_score: {:.2}, accuracy: {:.2}, auc: {:.2} (tn={} fp={} fn={} tp={})",
            self.sensitivity,
            self.specificity,
            self.precision,
            self.f1,
            self.accuracy,
            self.auc,
            self.confusion.tn,
            self.confusion.fp,
            self.confusion.fn_count,
            self.confusion.tp,
        )
    }
}

/// Metric battery of one head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadMetrics {
    pub head: Head,
    pub result: MetricsResult,
}

/// Runs the whole battery. Deterministic; never fails on degenerate class
/// balance, only on malformed input.
pub fn evaluate(
    y_true: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
    options: &MetricOptions,
) -> Result<MetricsResult, MetricsError> {
    validate_inputs(y_true, y_pred)?;

    let confusion = confusion_matrix(y_true, y_pred, options.threshold)?;
    let roc = roc_curve(y_true, y_pred)?;
    let auc = match &roc {
        Some(curve) => MetricValue::Defined(curve.auc()),
        None => MetricValue::Undefined,
    };
    let calibration = calibration_curve(y_true, y_pred, options.calibration_bins)?;

    Ok(MetricsResult {
        n_samples: y_true.len(),
        n_positive: y_true.iter().filter(|&&y| is_positive(y)).count(),
        confusion,
        sensitivity: confusion.sensitivity(),
        specificity: confusion.specificity(),
        precision: confusion.precision(),
        recall: confusion.recall(),
        accuracy: confusion.accuracy(),
        f1: confusion.f1(),
        auc,
        roc,
        calibration,
    })
}

/// Confusion matrix of `y_pred > threshold` against `y_true`.
pub fn confusion_matrix(
    y_true: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
    threshold: f64,
) -> Result<ConfusionMatrix, MetricsError> {
    validate_inputs(y_true, y_pred)?;
    let mut cm = ConfusionMatrix::default();
    for (&truth, &score) in y_true.iter().zip(y_pred.iter()) {
        match (is_positive(truth), score > threshold) {
            (true, true) => cm.tp += 1,
            (true, false) => cm.fn_count += 1,
            (false, true) => cm.fp += 1,
            (false, false) => cm.tn += 1,
        }
    }
    Ok(cm)
}

/// ROC curve over every distinct score, or `None` if either class is absent.
pub fn roc_curve(
    y_true: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
) -> Result<Option<RocCurve>, MetricsError> {
    validate_inputs(y_true, y_pred)?;

    let n_pos = y_true.iter().filter(|&&y| is_positive(y)).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Ok(None);
    }

    // Stable sort by descending score so ties keep input order.
    let mut order: Vec<usize> = (0..y_pred.len()).collect();
    order.sort_by(|&a, &b| y_pred[b].total_cmp(&y_pred[a]));

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];
    let (mut tps, mut fps) = (0usize, 0usize);

    for (rank, &idx) in order.iter().enumerate() {
        if is_positive(y_true[idx]) {
            tps += 1;
        } else {
            fps += 1;
        }
        let last_of_run = order
            .get(rank + 1)
            .map_or(true, |&next| y_pred[next] != y_pred[idx]);
        if last_of_run {
            fpr.push(fps as f64 / n_neg as f64);
            tpr.push(tps as f64 / n_pos as f64);
            thresholds.push(y_pred[idx]);
        }
    }

    Ok(Some(RocCurve {
        fpr,
        tpr,
        thresholds,
    }))
}

/// Uniform-bin reliability curve on predictions clipped to `[0, 1]`.
///
/// Bin edges are `i / n_bins`; a value equal to an inner edge falls into the
/// lower bin. Empty bins are omitted.
pub fn calibration_curve(
    y_true: ArrayView1<f64>,
    y_pred: ArrayView1<f64>,
    n_bins: usize,
) -> Result<CalibrationCurve, MetricsError> {
    validate_inputs(y_true, y_pred)?;
    if n_bins == 0 {
        return Err(MetricsError::ZeroCalibrationBins);
    }

    let step = 1.0 / n_bins as f64;
    let inner_edges: Vec<f64> = (1..n_bins).map(|i| i as f64 * step).collect();

    let mut counts = vec![0usize; n_bins];
    let mut pred_sums = vec![0.0; n_bins];
    let mut true_sums = vec![0.0; n_bins];

    for (&truth, &score) in y_true.iter().zip(y_pred.iter()) {
        let p = score.clamp(0.0, 1.0);
        let bin = inner_edges.partition_point(|&edge| edge < p);
        counts[bin] += 1;
        pred_sums[bin] += p;
        if is_positive(truth) {
            true_sums[bin] += 1.0;
        }
    }

    let bins = (0..n_bins)
        .filter(|&i| counts[i] > 0)
        .map(|i| CalibrationBin {
            mean_predicted: pred_sums[i] / counts[i] as f64,
            fraction_positive: true_sums[i] / counts[i] as f64,
            count: counts[i],
        })
        .collect();

    Ok(CalibrationCurve { n_bins, bins })
}

#[inline]
fn is_positive(label: f64) -> bool {
    label > 0.5
}

fn validate_inputs(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> Result<(), MetricsError> {
    if y_true.len() != y_pred.len() {
        return Err(MetricsError::LengthMismatch {
            y_true: y_true.len(),
            y_pred: y_pred.len(),
        });
    }
    if let Some((index, &value)) = y_pred.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(MetricsError::NonFinitePrediction { index, value });
    }
    Ok(())
}
