//! # Prediction Aggregation
//!
//! Collects per-batch model outputs and targets over one pass so that the
//! metric battery sees the whole split at once. Rows keep the order in which
//! batches were pushed.

use crate::heads::{Head, NUM_LABEL_COLUMNS, NUM_OUTPUTS, STAY_ID_COLUMN};
use crate::metrics::{self, HeadMetrics, MetricOptions, MetricsError};
use candle_core::{DType, Tensor};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, concatenate};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error(
        "Batch {batch} has {found} {what} columns, but {expected} are required."
    )]
    WrongWidth {
        batch: usize,
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("Batch {batch} has {predictions} prediction rows but {targets} target rows.")]
    RowMismatch {
        batch: usize,
        predictions: usize,
        targets: usize,
    },
    #[error("Failed to copy a device tensor to host memory: {0}")]
    Device(#[from] candle_core::Error),
    #[error("Internal shape error while assembling aggregated arrays: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Accumulates `(predictions, targets)` batches in processing order.
#[derive(Debug, Default)]
pub struct PredictionAggregator {
    predictions: Vec<Array2<f64>>,
    targets: Vec<Array2<f64>>,
    rows: usize,
}

impl PredictionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn num_batches(&self) -> usize {
        self.predictions.len()
    }

    /// Appends one host-resident batch.
    pub fn push(
        &mut self,
        predictions: ArrayView2<f64>,
        targets: ArrayView2<f64>,
    ) -> Result<(), AggregateError> {
        let batch = self.predictions.len();
        if predictions.ncols() != NUM_OUTPUTS {
            return Err(AggregateError::WrongWidth {
                batch,
                what: "prediction",
                found: predictions.ncols(),
                expected: NUM_OUTPUTS,
            });
        }
        if targets.ncols() != NUM_LABEL_COLUMNS {
            return Err(AggregateError::WrongWidth {
                batch,
                what: "target",
                found: targets.ncols(),
                expected: NUM_LABEL_COLUMNS,
            });
        }
        if predictions.nrows() != targets.nrows() {
            return Err(AggregateError::RowMismatch {
                batch,
                predictions: predictions.nrows(),
                targets: targets.nrows(),
            });
        }

        self.rows += predictions.nrows();
        self.predictions.push(predictions.to_owned());
        self.targets.push(targets.to_owned());
        Ok(())
    }

    /// Detaches device outputs from the graph, copies them to host `f64` and
    /// appends them with their targets.
    pub fn push_tensors(
        &mut self,
        predictions: &Tensor,
        targets: ArrayView2<f64>,
    ) -> Result<(), AggregateError> {
        let host = predictions.detach().to_dtype(DType::F64)?;
        let (rows, cols) = host.dims2()?;
        let flat: Vec<f64> = host.flatten_all()?.to_vec1()?;
        let predictions = Array2::from_shape_vec((rows, cols), flat)?;
        self.push(predictions.view(), targets)
    }

    /// Concatenated arrays over every batch pushed so far.
    pub fn snapshot(&self) -> Result<AggregatedPass, AggregateError> {
        Ok(AggregatedPass {
            predictions: stack_rows(&self.predictions, NUM_OUTPUTS)?,
            targets: stack_rows(&self.targets, NUM_LABEL_COLUMNS)?,
        })
    }
}

fn stack_rows(parts: &[Array2<f64>], width: usize) -> Result<Array2<f64>, AggregateError> {
    if parts.is_empty() {
        return Ok(Array2::zeros((0, width)));
    }
    let views: Vec<ArrayView2<f64>> = parts.iter().map(|a| a.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Predictions `[N x 6]` and targets `[N x 7]` for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPass {
    pub predictions: Array2<f64>,
    pub targets: Array2<f64>,
}

impl AggregatedPass {
    pub fn len(&self) -> usize {
        self.predictions.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ground truth column for a head.
    pub fn truth(&self, head: Head) -> ArrayView1<'_, f64> {
        self.targets.column(head.label_column())
    }

    /// Predicted column for a head.
    pub fn predicted(&self, head: Head) -> ArrayView1<'_, f64> {
        self.predictions.column(head.output_column())
    }

    pub fn stay_ids(&self) -> ArrayView1<'_, f64> {
        self.targets.column(STAY_ID_COLUMN)
    }

    /// The metric battery for every active head, in [`Head::ACTIVE`] order.
    pub fn evaluate_active(&self, options: &MetricOptions) -> Result<Vec<HeadMetrics>, MetricsError> {
        Head::ACTIVE
            .iter()
            .map(|&head| {
                let result = metrics::evaluate(self.truth(head), self.predicted(head), options)?;
                Ok(HeadMetrics { head, result })
            })
            .collect()
    }
}
