//! # Data Loading and Validation Module
//!
//! The single entry point for every file this crate consumes or hands off:
//!
//! - Sequence datasets: a `[N x L x F]` feature array and a `[N x 7]` label
//!   array stored as `.npy` files.
//! - The prediction table (`result.csv`): the durable hand-off between the
//!   test stage and the fairness audit.
//! - The demographic baseline table: integer codes per stay.
//!
//! Column names are fixed. Failures are assumed to be user-input errors and
//! surface as a [`DataError`] naming the offending column, row or key. Tabular
//! files are read with the `polars` CSV reader and validated column by column
//! before anything is converted into plain Rust structures.

use crate::aggregate::AggregatedPass;
use crate::fairness::Attribute;
use crate::heads::{Head, NUM_LABEL_COLUMNS, STAY_ID_COLUMN};
use candle_core::{DType, Device, Tensor};
use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to read array file: {0}")]
    ArrayError(#[from] candle_core::Error),
    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(
        "The required column '{0}' was not found in '{1}'. Please check spelling and case."
    )]
    ColumnNotFound(String, String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Column '{column}' holds the non-integer value {value} at row {row}; integer codes are required.")]
    NonIntegerValue {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("Key {key} appears more than once in '{table}'; one row per stay_id is required.")]
    DuplicateKey { table: String, key: i64 },
    #[error("Label column {column} holds the non-binary value {value} at row {row}.")]
    NonBinaryLabel {
        column: usize,
        row: usize,
        value: f64,
    },
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

// ========================================================================================
//                                  SEQUENCE DATASETS
// ========================================================================================

/// Time-ordered features and their label vectors, row-aligned.
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    /// Shape: `[n_records, seq_len, n_features]`.
    pub features: Array3<f32>,
    /// Shape: `[n_records, 7]`; see [`crate::heads`] for the column contract.
    pub labels: Array2<f64>,
}

impl SequenceDataset {
    /// Validates shapes and label values. Label matrices wider than seven
    /// columns are truncated to the seven the model consumes.
    pub fn new(features: Array3<f32>, labels: Array2<f64>) -> Result<Self, DataError> {
        if features.len_of(Axis(0)) != labels.nrows() {
            return Err(DataError::ShapeMismatch(format!(
                "{} feature sequences but {} label rows",
                features.len_of(Axis(0)),
                labels.nrows()
            )));
        }
        if labels.ncols() < NUM_LABEL_COLUMNS {
            return Err(DataError::ShapeMismatch(format!(
                "label array has {} columns, at least {NUM_LABEL_COLUMNS} are required",
                labels.ncols()
            )));
        }
        let labels = if labels.ncols() > NUM_LABEL_COLUMNS {
            log::debug!(
                "Dropping {} trailing label columns",
                labels.ncols() - NUM_LABEL_COLUMNS
            );
            labels.slice(s![.., ..NUM_LABEL_COLUMNS]).to_owned()
        } else {
            labels
        };
        if labels.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("labels".to_string()));
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("features".to_string()));
        }
        for head in Head::ACTIVE {
            let column = head.label_column();
            if let Some((row, &value)) = labels
                .column(column)
                .iter()
                .enumerate()
                .find(|(_, v)| **v != 0.0 && **v != 1.0)
            {
                return Err(DataError::NonBinaryLabel { column, row, value });
            }
        }
        Ok(Self { features, labels })
    }

    /// Loads a dataset from a pair of `.npy` files.
    pub fn load_npy(features_path: &Path, labels_path: &Path) -> Result<Self, DataError> {
        log::info!(
            "Loading sequences from '{}' and labels from '{}'",
            features_path.display(),
            labels_path.display()
        );
        let x = Tensor::read_npy(features_path)?.to_dtype(DType::F32)?;
        let (n, seq_len, n_features) = x.dims3()?;
        let features = Array3::from_shape_vec(
            (n, seq_len, n_features),
            x.flatten_all()?.to_vec1::<f32>()?,
        )?;

        let y = Tensor::read_npy(labels_path)?.to_dtype(DType::F64)?;
        let (rows, cols) = y.dims2()?;
        let labels = Array2::from_shape_vec((rows, cols), y.flatten_all()?.to_vec1::<f64>()?)?;

        let dataset = Self::new(features, labels)?;
        log::info!(
            "Loaded {} records of {} steps x {} features",
            dataset.len(),
            dataset.seq_len(),
            dataset.num_features()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.features.len_of(Axis(1))
    }

    pub fn num_features(&self) -> usize {
        self.features.len_of(Axis(2))
    }

    /// Binary labels of one head, used for stratified splitting.
    pub fn class_labels(&self, head: Head) -> Vec<u8> {
        self.labels
            .column(head.label_column())
            .iter()
            .map(|&v| u8::from(v > 0.5))
            .collect()
    }

    /// Copies the selected records into a new dataset, in the given order.
    pub fn subset(&self, indices: &[usize]) -> SequenceDataset {
        SequenceDataset {
            features: self.features.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
        }
    }

    /// Builds the `[b x L x F]` input tensor for a batch together with the
    /// host-side label rows.
    pub fn batch(
        &self,
        indices: &[usize],
        device: &Device,
    ) -> Result<(Tensor, Array2<f64>), DataError> {
        let features = self.features.select(Axis(0), indices);
        let flat: Vec<f32> = features.iter().copied().collect();
        let input = Tensor::from_vec(
            flat,
            (indices.len(), self.seq_len(), self.num_features()),
            device,
        )?;
        Ok((input, self.labels.select(Axis(0), indices)))
    }
}

/// Converts labels to an `f32` tensor for the loss.
pub fn labels_to_tensor(labels: ArrayView2<f64>, device: &Device) -> Result<Tensor, DataError> {
    let flat: Vec<f32> = labels.iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(flat, (labels.nrows(), labels.ncols()), device)?)
}

// ========================================================================================
//                                  PREDICTION TABLE
// ========================================================================================

/// Column names of the prediction table, in file order.
pub const PREDICTION_COLUMNS: [&str; 9] = [
    "stay_id",
    "label_hosp_gt",
    "label_icu_gt",
    "die_24_gt",
    "alive_24_gt",
    "label_hosp",
    "label_icu",
    "die_24",
    "alive_24",
];

/// One evaluated stay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub stay_id: i64,
    pub label_hosp_gt: f64,
    pub label_icu_gt: f64,
    pub die_24_gt: f64,
    pub alive_24_gt: f64,
    pub label_hosp: f64,
    pub label_icu: f64,
    pub die_24: f64,
    pub alive_24: f64,
}

impl PredictionRow {
    /// Ground truth for an active head.
    pub fn truth(&self, head: Head) -> Option<f64> {
        match head {
            Head::HospitalMortality => Some(self.label_hosp_gt),
            Head::IcuMortality => Some(self.label_icu_gt),
            Head::DieWithin24h => Some(self.die_24_gt),
            Head::LeaveIcuWithin24h => Some(self.alive_24_gt),
            Head::IcuLengthOfStay | Head::HospitalLengthOfStay => None,
        }
    }

    /// Prediction for an active head.
    pub fn predicted(&self, head: Head) -> Option<f64> {
        match head {
            Head::HospitalMortality => Some(self.label_hosp),
            Head::IcuMortality => Some(self.label_icu),
            Head::DieWithin24h => Some(self.die_24),
            Head::LeaveIcuWithin24h => Some(self.alive_24),
            Head::IcuLengthOfStay | Head::HospitalLengthOfStay => None,
        }
    }
}

/// Per-stay predictions and ground truth, one row per `stay_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionTable {
    rows: Vec<PredictionRow>,
}

impl PredictionTable {
    pub fn new(rows: Vec<PredictionRow>) -> Result<Self, DataError> {
        ensure_unique_keys("prediction table", rows.iter().map(|r| r.stay_id))?;
        Ok(Self { rows })
    }

    /// Builds the table from an evaluation pass. The stay id is the first
    /// label column.
    pub fn from_pass(pass: &AggregatedPass) -> Result<Self, DataError> {
        let ids = integer_values("stay_id", pass.targets.column(STAY_ID_COLUMN).iter().copied())?;
        let rows = ids
            .into_iter()
            .enumerate()
            .map(|(i, stay_id)| {
                let gt = |head: Head| pass.targets[[i, head.label_column()]];
                let pred = |head: Head| pass.predictions[[i, head.output_column()]];
                PredictionRow {
                    stay_id,
                    label_hosp_gt: gt(Head::HospitalMortality),
                    label_icu_gt: gt(Head::IcuMortality),
                    die_24_gt: gt(Head::DieWithin24h),
                    alive_24_gt: gt(Head::LeaveIcuWithin24h),
                    label_hosp: pred(Head::HospitalMortality),
                    label_icu: pred(Head::IcuMortality),
                    die_24: pred(Head::DieWithin24h),
                    alive_24: pred(Head::LeaveIcuWithin24h),
                }
            })
            .collect();
        Self::new(rows)
    }

    pub fn rows(&self) -> &[PredictionRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the table as a comma-separated file with a header row.
    pub fn write_csv(&self, path: &Path) -> Result<(), DataError> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_csv(path: &Path) -> Result<Self, DataError> {
        let df = internal::read_csv(path, &PREDICTION_COLUMNS)?;
        let stay_ids = internal::extract_integer_column(&df, "stay_id")?;
        let mut columns = Vec::with_capacity(PREDICTION_COLUMNS.len() - 1);
        for name in &PREDICTION_COLUMNS[1..] {
            columns.push(internal::extract_numeric_column(&df, name)?);
        }

        let rows = stay_ids
            .into_iter()
            .enumerate()
            .map(|(i, stay_id)| PredictionRow {
                stay_id,
                label_hosp_gt: columns[0][i],
                label_icu_gt: columns[1][i],
                die_24_gt: columns[2][i],
                alive_24_gt: columns[3][i],
                label_hosp: columns[4][i],
                label_icu: columns[5][i],
                die_24: columns[6][i],
                alive_24: columns[7][i],
            })
            .collect();
        let table = Self::new(rows)?;
        log::info!("Loaded {} prediction rows from '{}'", table.len(), path.display());
        Ok(table)
    }
}

// ========================================================================================
//                                DEMOGRAPHIC BASELINE
// ========================================================================================

/// Demographic codes of one stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineRow {
    pub stay_id: i64,
    pub race: i64,
    pub gender: i64,
    pub insurance: i64,
    pub admission_type: i64,
}

impl BaselineRow {
    pub fn code(&self, attribute: Attribute) -> i64 {
        match attribute {
            Attribute::Race => self.race,
            Attribute::Gender => self.gender,
            Attribute::Insurance => self.insurance,
            Attribute::AdmissionType => self.admission_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemographicBaseline {
    rows: Vec<BaselineRow>,
}

impl DemographicBaseline {
    pub fn new(rows: Vec<BaselineRow>) -> Result<Self, DataError> {
        ensure_unique_keys("baseline table", rows.iter().map(|r| r.stay_id))?;
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[BaselineRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Loads `stay_id` and the four attribute columns; other columns are ignored.
    pub fn load_csv(path: &Path) -> Result<Self, DataError> {
        let mut required = vec!["stay_id"];
        required.extend(Attribute::ALL.iter().map(|a| a.column()));
        let df = internal::read_csv(path, &required)?;

        let stay_ids = internal::extract_integer_column(&df, "stay_id")?;
        let race = internal::extract_integer_column(&df, Attribute::Race.column())?;
        let gender = internal::extract_integer_column(&df, Attribute::Gender.column())?;
        let insurance = internal::extract_integer_column(&df, Attribute::Insurance.column())?;
        let admission =
            internal::extract_integer_column(&df, Attribute::AdmissionType.column())?;

        let rows = (0..stay_ids.len())
            .map(|i| BaselineRow {
                stay_id: stay_ids[i],
                race: race[i],
                gender: gender[i],
                insurance: insurance[i],
                admission_type: admission[i],
            })
            .collect();
        let table = Self::new(rows)?;
        log::info!("Loaded {} baseline rows from '{}'", table.len(), path.display());
        Ok(table)
    }
}

fn ensure_unique_keys(table: &str, keys: impl Iterator<Item = i64>) -> Result<(), DataError> {
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(DataError::DuplicateKey {
                table: table.to_string(),
                key,
            });
        }
    }
    Ok(())
}

fn integer_values(
    column: &str,
    values: impl Iterator<Item = f64>,
) -> Result<Vec<i64>, DataError> {
    values
        .enumerate()
        .map(|(row, value)| {
            if value.fract() != 0.0 || value >= i64::MAX as f64 || value < i64::MIN as f64 {
                Err(DataError::NonIntegerValue {
                    column: column.to_string(),
                    row,
                    value,
                })
            } else {
                Ok(value as i64)
            }
        })
        .collect()
}

/// Internal module for shared CSV loading logic.
mod internal {
    use super::*;

    /// Reads a comma-separated file and verifies that every required column exists.
    pub(super) fn read_csv(path: &Path, required: &[&str]) -> Result<DataFrame, DataError> {
        log::debug!("Loading table from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(CsvReadOptions::default().with_has_header(true))
            .finish()?;

        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for col_name in required {
            if !columns_set.contains(*col_name) {
                return Err(DataError::ColumnNotFound(
                    col_name.to_string(),
                    path.display().to_string(),
                ));
            }
        }
        Ok(df)
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Numeric column whose values must all be whole numbers.
    pub(super) fn extract_integer_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<i64>, DataError> {
        let values = extract_numeric_column(df, column_name)?;
        integer_values(column_name, values.into_iter())
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn labels(rows: &[[f64; 7]]) -> Array2<f64> {
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), 7), flat).unwrap()
    }

    #[test]
    fn sequence_dataset_validates_shapes() {
        let features = Array3::<f32>::zeros((3, 4, 2));
        let too_few = labels(&[[1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 1.0]; 2]);
        assert!(matches!(
            SequenceDataset::new(features.clone(), too_few),
            Err(DataError::ShapeMismatch(_))
        ));

        let narrow = Array2::<f64>::zeros((3, 5));
        assert!(matches!(
            SequenceDataset::new(features, narrow),
            Err(DataError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn sequence_dataset_truncates_wide_labels_and_rejects_non_binary_targets() {
        let features = Array3::<f32>::zeros((2, 3, 1));
        let wide = Array2::from_shape_fn((2, 8), |(r, c)| if c == 0 { r as f64 } else { 0.0 });
        let dataset = SequenceDataset::new(features.clone(), wide).unwrap();
        assert_eq!(dataset.labels.ncols(), NUM_LABEL_COLUMNS);

        let bad = labels(&[
            [1.0, 0.0, 0.0, 3.5, 4.0, 0.0, 1.0],
            [2.0, 0.0, 0.7, 3.5, 4.0, 0.0, 1.0],
        ]);
        match SequenceDataset::new(features, bad).unwrap_err() {
            DataError::NonBinaryLabel { column, row, .. } => {
                assert_eq!(column, Head::IcuMortality.label_column());
                assert_eq!(row, 1);
            }
            other => panic!("Expected NonBinaryLabel, got {other:?}"),
        }
    }

    #[test]
    fn batch_and_subset_follow_index_order() {
        let features = Array3::from_shape_fn((4, 2, 3), |(n, l, f)| (n * 100 + l * 10 + f) as f32);
        let y = labels(&[
            [10.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
            [11.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            [12.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0],
            [13.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
        ]);
        let dataset = SequenceDataset::new(features, y).unwrap();
        assert_eq!(dataset.class_labels(Head::HospitalMortality), vec![0, 1, 0, 1]);

        let subset = dataset.subset(&[3, 1]);
        assert_eq!(subset.labels[[0, 0]], 13.0);
        assert_eq!(subset.labels[[1, 0]], 11.0);

        let (input, host) = dataset.batch(&[2, 0], &Device::Cpu).unwrap();
        assert_eq!(input.dims(), &[2, 2, 3]);
        let values: Vec<f32> = input.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values[0], 200.0);
        assert_eq!(values[6], 0.0);
        assert_eq!(host[[0, 0]], 12.0);
    }

    fn sample_rows() -> Vec<PredictionRow> {
        vec![
            PredictionRow {
                stay_id: 30000001,
                label_hosp_gt: 1.0,
                label_icu_gt: 0.0,
                die_24_gt: 0.0,
                alive_24_gt: 1.0,
                label_hosp: 0.83,
                label_icu: 0.12,
                die_24: 0.05,
                alive_24: 0.66,
            },
            PredictionRow {
                stay_id: 30000002,
                label_hosp_gt: 0.0,
                label_icu_gt: 0.0,
                die_24_gt: 0.0,
                alive_24_gt: 0.0,
                label_hosp: 0.21,
                label_icu: 0.4,
                die_24: 0.01,
                alive_24: 0.3,
            },
        ]
    }

    #[test]
    fn prediction_table_survives_a_csv_round_trip() {
        let table = PredictionTable::new(sample_rows()).unwrap();
        let file = NamedTempFile::new().unwrap();
        table.write_csv(file.path()).unwrap();

        let loaded = PredictionTable::load_csv(file.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.rows()[0].stay_id, 30000001);
        assert_abs_diff_eq!(loaded.rows()[0].label_hosp, 0.83, epsilon = 1e-12);
        assert_abs_diff_eq!(loaded.rows()[1].alive_24, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn prediction_table_accepts_float_formatted_ids() {
        let content = "stay_id,label_hosp_gt,label_icu_gt,die_24_gt,alive_24_gt,label_hosp,label_icu,die_24,alive_24\n\
30000153.0,1.0,0.0,0.0,1.0,0.9,0.1,0.2,0.7";
        let file = create_test_csv(content).unwrap();
        let table = PredictionTable::load_csv(file.path()).unwrap();
        assert_eq!(table.rows()[0].stay_id, 30000153);
    }

    #[test]
    fn prediction_table_rejects_duplicate_stays() {
        let mut rows = sample_rows();
        rows[1].stay_id = rows[0].stay_id;
        match PredictionTable::new(rows).unwrap_err() {
            DataError::DuplicateKey { key, .. } => assert_eq!(key, 30000001),
            other => panic!("Expected DuplicateKey, got {other:?}"),
        }
    }

    #[test]
    fn prediction_table_requires_every_column() {
        let content = "stay_id,label_hosp_gt,label_icu_gt,die_24_gt,label_hosp,label_icu,die_24,alive_24\n\
1,1,0,0,0.9,0.1,0.2,0.7";
        let file = create_test_csv(content).unwrap();
        match PredictionTable::load_csv(file.path()).unwrap_err() {
            DataError::ColumnNotFound(col, _) => assert_eq!(col, "alive_24_gt"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn prediction_table_is_built_from_a_pass_with_offset_columns() {
        let targets = labels(&[[42.0, 1.0, 0.0, 3.0, 9.0, 1.0, 0.0]]);
        let predictions =
            Array2::from_shape_vec((1, 6), vec![0.9, 0.2, 3.3, 3.3, 0.7, 0.1]).unwrap();
        let pass = AggregatedPass {
            predictions,
            targets,
        };
        let table = PredictionTable::from_pass(&pass).unwrap();
        let row = &table.rows()[0];
        assert_eq!(row.stay_id, 42);
        assert_eq!(row.label_hosp_gt, 1.0);
        assert_eq!(row.die_24_gt, 1.0);
        assert_eq!(row.alive_24_gt, 0.0);
        assert_eq!(row.label_hosp, 0.9);
        assert_eq!(row.die_24, 0.7);
        assert_eq!(row.alive_24, 0.1);
    }

    #[test]
    fn baseline_loads_codes_and_ignores_extra_columns() {
        let content = "stay_id,age,race,gender,insurance,admission_type\n\
1,70,3,1,2,9\n\
2,55,8.0,0,4,1";
        let file = create_test_csv(content).unwrap();
        let baseline = DemographicBaseline::load_csv(file.path()).unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(baseline.rows()[1].code(Attribute::Race), 8);
        assert_eq!(baseline.rows()[0].code(Attribute::AdmissionType), 9);
    }

    #[test]
    fn baseline_rejects_missing_and_fractional_codes() {
        let missing = "stay_id,race,gender,insurance\n1,3,1,2";
        let file = create_test_csv(missing).unwrap();
        match DemographicBaseline::load_csv(file.path()).unwrap_err() {
            DataError::ColumnNotFound(col, _) => assert_eq!(col, "admission_type"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }

        let fractional = "stay_id,race,gender,insurance,admission_type\n1,3.5,1,2,4";
        let file = create_test_csv(fractional).unwrap();
        assert!(matches!(
            DemographicBaseline::load_csv(file.path()).unwrap_err(),
            DataError::NonIntegerValue { row: 0, .. }
        ));

        let null = "stay_id,race,gender,insurance,admission_type\n1,,1,2,4\n2,3,0,1,1";
        let file = create_test_csv(null).unwrap();
        match DemographicBaseline::load_csv(file.path()).unwrap_err() {
            DataError::MissingValuesFound(col) => assert_eq!(col, "race"),
            other => panic!("Expected MissingValuesFound, got {other:?}"),
        }
    }

    #[test]
    fn integer_values_reject_out_of_range_magnitudes() {
        let two_pow_63 = 2f64.powi(63);
        assert!(matches!(
            integer_values("stay_id", [1.0, two_pow_63].into_iter()).unwrap_err(),
            DataError::NonIntegerValue { row: 1, .. }
        ));
        assert_eq!(
            integer_values("stay_id", [-two_pow_63, 7.0].into_iter()).unwrap(),
            vec![i64::MIN, 7]
        );
        assert!(integer_values("stay_id", [f64::INFINITY].into_iter()).is_err());
    }
}
