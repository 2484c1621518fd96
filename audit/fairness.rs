//! # Demographic Stratification
//!
//! Audits the prediction table subgroup by subgroup. Each demographic
//! attribute has a fixed code table mapping raw integer codes to readable
//! bucket labels. Several codes may share a label (race collapses four codes
//! into `Other`); such codes are merged into a single bucket before any
//! statistic is computed.
//!
//! Joining is an inner join on `stay_id`. Stays missing from either table are
//! dropped; the counts are logged but the stays are not evaluated anywhere.
//! A code that is absent from its table aborts the attribute with
//! [`FairnessError::UnknownCategoryCode`]. Buckets with no rows are skipped,
//! and buckets too small for some ratio carry [`MetricValue::Undefined`]
//! without affecting their siblings.
//!
//! [`MetricValue::Undefined`]: crate::metrics::MetricValue::Undefined

use crate::data::{BaselineRow, DemographicBaseline, PredictionRow, PredictionTable};
use crate::heads::Head;
use crate::metrics::{self, HeadMetrics, MetricOptions, MetricsError};
use ahash::AHashMap;
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FairnessError {
    #[error(
        "Stay {stay_id} has {attribute} code {code}, which is not in the {attribute} code table."
    )]
    UnknownCategoryCode {
        attribute: Attribute,
        code: i64,
        stay_id: i64,
    },
    #[error("Code {code} is mapped twice in the {attribute} code table.")]
    DuplicateCode { attribute: Attribute, code: i64 },
    #[error("Metric computation failed for bucket '{bucket}': {source}")]
    Metrics {
        bucket: String,
        #[source]
        source: MetricsError,
    },
}

/// Demographic attributes present in the baseline table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Race,
    Gender,
    Insurance,
    AdmissionType,
}

impl Attribute {
    pub const ALL: [Attribute; 4] = [
        Attribute::Race,
        Attribute::Gender,
        Attribute::Insurance,
        Attribute::AdmissionType,
    ];

    /// Column name in the baseline table.
    pub const fn column(self) -> &'static str {
        match self {
            Attribute::Race => "race",
            Attribute::Gender => "gender",
            Attribute::Insurance => "insurance",
            Attribute::AdmissionType => "admission_type",
        }
    }

    /// The fixed code table for this attribute.
    pub fn lookup_table(self) -> CodeLookupTable {
        let entries: &[(i64, &str)] = match self {
            Attribute::Gender => &[(1, "Male"), (0, "Female")],
            Attribute::Race => &[
                (1, "Other"),
                (2, "Other"),
                (3, "Asian"),
                (4, "White"),
                (5, "Other"),
                (6, "Black_African"),
                (7, "Other"),
                (8, "Hispanic_Latino"),
            ],
            Attribute::Insurance => &[
                (1, "Government"),
                (2, "Medicaid"),
                (3, "Medicare"),
                (4, "Private"),
                (5, "Self_pay"),
                (6, "Others"),
            ],
            Attribute::AdmissionType => &[
                (1, "AMBULATORY_OBSERVATION"),
                (2, "DIRECT_EMER"),
                (3, "DIRECT OBSERVATION"),
                (4, "ELECTIVE"),
                (5, "EU_OBSERVATION"),
                (6, "EW_EMER"),
                (7, "OBSERVATION_ADMIT"),
                (8, "SURGICAL SAME DAY ADMISSION"),
                (9, "URGENT"),
            ],
        };
        CodeLookupTable {
            attribute: self,
            entries: entries
                .iter()
                .map(|&(code, label)| (code, label.to_string()))
                .collect(),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

// ========================================================================================
//                                  CODE LOOKUP TABLES
// ========================================================================================

/// Ordered `code -> label` mapping; several codes may share one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLookupTable {
    attribute: Attribute,
    entries: Vec<(i64, String)>,
}

/// All codes that collapse into one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeGroup {
    pub label: String,
    pub codes: Vec<i64>,
}

impl CodeLookupTable {
    pub fn new<S: Into<String>>(
        attribute: Attribute,
        entries: impl IntoIterator<Item = (i64, S)>,
    ) -> Result<Self, FairnessError> {
        let entries: Vec<(i64, String)> = entries
            .into_iter()
            .map(|(code, label)| (code, label.into()))
            .collect();
        for (i, (code, _)) in entries.iter().enumerate() {
            if entries[..i].iter().any(|(seen, _)| seen == code) {
                return Err(FairnessError::DuplicateCode {
                    attribute,
                    code: *code,
                });
            }
        }
        Ok(Self { attribute, entries })
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn label_for(&self, code: i64) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, label)| label.as_str())
    }

    /// Reverse grouping: one entry per distinct label, ordered by the first
    /// appearance of the label in the table.
    pub fn grouped(&self) -> Vec<CodeGroup> {
        let mut groups: Vec<CodeGroup> = Vec::new();
        for (code, label) in &self.entries {
            match groups.iter_mut().find(|g| &g.label == label) {
                Some(group) => group.codes.push(*code),
                None => groups.push(CodeGroup {
                    label: label.clone(),
                    codes: vec![*code],
                }),
            }
        }
        groups
    }
}

// ========================================================================================
//                                    JOIN AND GROUP
// ========================================================================================

/// A prediction row matched with its demographic codes.
#[derive(Debug, Clone, Copy)]
pub struct JoinedRecord<'a> {
    pub prediction: &'a PredictionRow,
    pub baseline: &'a BaselineRow,
}

impl JoinedRecord<'_> {
    pub fn stay_id(&self) -> i64 {
        self.prediction.stay_id
    }
}

/// The inner join of the prediction and baseline tables, in prediction order.
#[derive(Debug, Clone)]
pub struct JoinedTable<'a> {
    pub records: Vec<JoinedRecord<'a>>,
    /// Prediction rows with no baseline entry.
    pub unmatched_predictions: usize,
    /// Baseline rows with no prediction.
    pub unmatched_baseline: usize,
}

pub fn inner_join<'a>(
    predictions: &'a PredictionTable,
    baseline: &'a DemographicBaseline,
) -> JoinedTable<'a> {
    let index: AHashMap<i64, &BaselineRow> =
        baseline.rows().iter().map(|row| (row.stay_id, row)).collect();

    let records: Vec<JoinedRecord<'a>> = predictions
        .rows()
        .iter()
        .filter_map(|prediction| {
            index.get(&prediction.stay_id).map(|baseline| JoinedRecord {
                prediction,
                baseline,
            })
        })
        .collect();

    let joined = records.len();
    JoinedTable {
        records,
        unmatched_predictions: predictions.len() - joined,
        unmatched_baseline: baseline.len() - joined,
    }
}

/// The records of one collapsed label.
#[derive(Debug, Clone)]
pub struct Bucket<'a> {
    pub label: String,
    pub codes: Vec<i64>,
    pub records: Vec<JoinedRecord<'a>>,
}

impl Bucket<'_> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `(y_true, y_pred)` columns for an active head.
    pub fn columns(&self, head: Head) -> (Array1<f64>, Array1<f64>) {
        let truth = self
            .records
            .iter()
            .map(|r| r.prediction.truth(head).unwrap_or(f64::NAN))
            .collect();
        let predicted = self
            .records
            .iter()
            .map(|r| r.prediction.predicted(head).unwrap_or(f64::NAN))
            .collect();
        (truth, predicted)
    }
}

/// Groups joined records by collapsed label. Every group of the table is
/// returned, including empty ones, in [`CodeLookupTable::grouped`] order.
pub fn group_into_buckets<'a>(
    joined: &[JoinedRecord<'a>],
    table: &CodeLookupTable,
) -> Result<Vec<Bucket<'a>>, FairnessError> {
    let groups = table.grouped();
    let mut group_of_code: AHashMap<i64, usize> = AHashMap::new();
    for (g, group) in groups.iter().enumerate() {
        for &code in &group.codes {
            group_of_code.insert(code, g);
        }
    }

    let mut buckets: Vec<Bucket<'a>> = groups
        .into_iter()
        .map(|group| Bucket {
            label: group.label,
            codes: group.codes,
            records: Vec::new(),
        })
        .collect();

    for record in joined {
        let code = record.baseline.code(table.attribute());
        let Some(&g) = group_of_code.get(&code) else {
            return Err(FairnessError::UnknownCategoryCode {
                attribute: table.attribute(),
                code,
                stay_id: record.stay_id(),
            });
        };
        buckets[g].records.push(*record);
    }
    Ok(buckets)
}

// ========================================================================================
//                                       REPORTS
// ========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BucketReport {
    pub label: String,
    pub codes: Vec<i64>,
    pub stay_ids: Vec<i64>,
    /// One entry per active head, in [`Head::ACTIVE`] order.
    pub metrics: Vec<HeadMetrics>,
}

impl BucketReport {
    pub fn len(&self) -> usize {
        self.stay_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stay_ids.is_empty()
    }

    /// Heads whose battery has at least one undefined metric.
    pub fn insufficient_heads(&self) -> Vec<Head> {
        self.metrics
            .iter()
            .filter(|m| m.result.has_undefined())
            .map(|m| m.head)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeReport {
    pub attribute: Attribute,
    pub joined_rows: usize,
    pub unmatched_predictions: usize,
    pub unmatched_baseline: usize,
    /// Non-empty buckets only, in code-table order.
    pub buckets: Vec<BucketReport>,
}

/// Stratifies one attribute and runs the metric battery on every non-empty bucket.
pub fn stratify(
    predictions: &PredictionTable,
    baseline: &DemographicBaseline,
    table: &CodeLookupTable,
    options: &MetricOptions,
) -> Result<AttributeReport, FairnessError> {
    let joined = inner_join(predictions, baseline);
    if joined.unmatched_predictions > 0 || joined.unmatched_baseline > 0 {
        log::info!(
            "Inner join on stay_id kept {} rows ({} prediction rows and {} baseline rows had no partner)",
            joined.records.len(),
            joined.unmatched_predictions,
            joined.unmatched_baseline
        );
    }
    let report = stratify_joined(&joined, table, options)?;
    Ok(report)
}

/// As [`stratify`], over an existing join.
pub fn stratify_joined(
    joined: &JoinedTable<'_>,
    table: &CodeLookupTable,
    options: &MetricOptions,
) -> Result<AttributeReport, FairnessError> {
    let attribute = table.attribute();
    let buckets: Vec<Bucket<'_>> = group_into_buckets(&joined.records, table)?
        .into_iter()
        .filter(|bucket| {
            if bucket.is_empty() {
                log::debug!("{attribute}: bucket '{}' is empty, skipping", bucket.label);
            }
            !bucket.is_empty()
        })
        .collect();

    let reports = buckets
        .par_iter()
        .map(|bucket| evaluate_bucket(bucket, options))
        .collect::<Result<Vec<_>, _>>()?;

    for report in &reports {
        log::info!("{attribute}: {} ({} stays)", report.label, report.len());
        let insufficient = report.insufficient_heads();
        if !insufficient.is_empty() {
            log::warn!(
                "{attribute}: bucket '{}' has insufficient data for some metrics of {:?}",
                report.label,
                insufficient
            );
        }
    }

    Ok(AttributeReport {
        attribute,
        joined_rows: joined.records.len(),
        unmatched_predictions: joined.unmatched_predictions,
        unmatched_baseline: joined.unmatched_baseline,
        buckets: reports,
    })
}

fn evaluate_bucket(bucket: &Bucket<'_>, options: &MetricOptions) -> Result<BucketReport, FairnessError> {
    let mut metrics = Vec::with_capacity(Head::ACTIVE.len());
    for head in Head::ACTIVE {
        let (truth, predicted) = bucket.columns(head);
        let result = metrics::evaluate(truth.view(), predicted.view(), options).map_err(
            |source| FairnessError::Metrics {
                bucket: bucket.label.clone(),
                source,
            },
        )?;
        metrics.push(HeadMetrics { head, result });
    }
    Ok(BucketReport {
        label: bucket.label.clone(),
        codes: bucket.codes.clone(),
        stay_ids: bucket.records.iter().map(|r| r.stay_id()).collect(),
        metrics,
    })
}

/// Stratifies every requested attribute with its fixed code table. The join
/// is computed once and shared.
pub fn audit_all(
    predictions: &PredictionTable,
    baseline: &DemographicBaseline,
    attributes: &[Attribute],
    options: &MetricOptions,
) -> Result<Vec<AttributeReport>, FairnessError> {
    let joined = inner_join(predictions, baseline);
    log::info!(
        "Joined {} of {} prediction rows with the baseline table",
        joined.records.len(),
        predictions.len()
    );
    attributes
        .iter()
        .map(|attribute| stratify_joined(&joined, &attribute.lookup_table(), options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use std::collections::HashSet;

    fn prediction(stay_id: i64, gt: f64, pred: f64) -> PredictionRow {
        PredictionRow {
            stay_id,
            label_hosp_gt: gt,
            label_icu_gt: gt,
            die_24_gt: 0.0,
            alive_24_gt: 1.0 - gt,
            label_hosp: pred,
            label_icu: pred,
            die_24: pred / 2.0,
            alive_24: 1.0 - pred,
        }
    }

    fn baseline_row(stay_id: i64, race: i64) -> BaselineRow {
        BaselineRow {
            stay_id,
            race,
            gender: stay_id % 2,
            insurance: 1 + stay_id % 6,
            admission_type: 1 + stay_id % 9,
        }
    }

    fn tables(races: &[(i64, i64)]) -> (PredictionTable, DemographicBaseline) {
        let predictions = races
            .iter()
            .map(|&(id, _)| prediction(id, (id % 2) as f64, (id % 5) as f64 / 5.0))
            .collect();
        let baseline = races.iter().map(|&(id, race)| baseline_row(id, race)).collect();
        (
            PredictionTable::new(predictions).unwrap(),
            DemographicBaseline::new(baseline).unwrap(),
        )
    }

    #[test]
    fn race_table_collapses_four_codes_into_other() {
        let groups = Attribute::Race.lookup_table().grouped();
        let labels: Vec<&str> = groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["Other", "Asian", "White", "Black_African", "Hispanic_Latino"]
        );
        assert_eq!(groups[0].codes, vec![1, 2, 5, 7]);

        let table = Attribute::Race.lookup_table();
        for group in &groups {
            for &code in &group.codes {
                assert_eq!(table.label_for(code), Some(group.label.as_str()));
            }
        }
        assert_eq!(table.label_for(42), None);
    }

    #[test]
    fn fixed_taxonomies_have_expected_sizes() {
        let sizes: Vec<usize> = Attribute::ALL
            .iter()
            .map(|a| a.lookup_table().grouped().len())
            .collect();
        assert_eq!(sizes, vec![5, 2, 6, 9]);
        let gender: Vec<String> = Attribute::Gender
            .lookup_table()
            .grouped()
            .into_iter()
            .map(|g| g.label)
            .collect();
        assert_eq!(gender, vec!["Male", "Female"]);
    }

    #[test]
    fn collapsed_bucket_size_is_sum_of_code_counts() {
        let rows: Vec<(i64, i64)> = vec![
            (1, 1),
            (2, 2),
            (3, 2),
            (4, 5),
            (5, 7),
            (6, 7),
            (7, 7),
            (8, 3),
            (9, 4),
        ];
        let (preds, baseline) = tables(&rows);
        let report = stratify(
            &preds,
            &baseline,
            &Attribute::Race.lookup_table(),
            &MetricOptions::default(),
        )
        .unwrap();

        let other = report.buckets.iter().find(|b| b.label == "Other").unwrap();
        assert_eq!(other.len(), 1 + 2 + 1 + 3);
        assert_eq!(other.codes, vec![1, 2, 5, 7]);
        assert_eq!(report.buckets.len(), 3);
    }

    #[test]
    fn buckets_partition_the_inner_join() {
        let rows: Vec<(i64, i64)> = (1..=40).map(|id| (id, 1 + id % 8)).collect();
        let (preds, baseline) = tables(&rows);
        // One prediction without a baseline row and one baseline row without a prediction.
        let mut pred_rows = preds.rows().to_vec();
        pred_rows.push(prediction(999, 1.0, 0.9));
        let mut base_rows = baseline.rows().to_vec();
        base_rows.push(baseline_row(555, 3));
        let preds = PredictionTable::new(pred_rows).unwrap();
        let baseline = DemographicBaseline::new(base_rows).unwrap();

        for attribute in Attribute::ALL {
            let report =
                stratify(&preds, &baseline, &attribute.lookup_table(), &MetricOptions::default())
                    .unwrap();
            assert_eq!(report.unmatched_predictions, 1);
            assert_eq!(report.unmatched_baseline, 1);

            let mut seen = HashSet::new();
            for bucket in &report.buckets {
                for id in &bucket.stay_ids {
                    assert!(seen.insert(*id), "stay {id} appears in two buckets");
                }
            }
            let expected: HashSet<i64> = (1..=40).collect();
            assert_eq!(seen, expected);
            assert_eq!(report.joined_rows, 40);
        }
    }

    #[test]
    fn empty_buckets_are_omitted() {
        let table = CodeLookupTable::new(Attribute::Race, [(3, "Asian"), (4, "White")]).unwrap();
        let (preds, baseline) = tables(&[(10, 3), (11, 3)]);
        let report = stratify(&preds, &baseline, &table, &MetricOptions::default()).unwrap();

        assert_eq!(report.buckets.len(), 1);
        assert_eq!(report.buckets[0].label, "Asian");
        assert_eq!(report.buckets[0].len(), 2);
        assert!(report.buckets.iter().all(|b| b.label != "White"));

        // The grouping step itself still sees the empty bucket.
        let joined = inner_join(&preds, &baseline);
        let buckets = group_into_buckets(&joined.records, &table).unwrap();
        assert_eq!(buckets.len(), 2);
        assert!(buckets[1].is_empty());
    }

    #[test]
    fn unknown_code_fails_the_attribute() {
        let (preds, baseline) = tables(&[(1, 3), (2, 42)]);
        let err = stratify(
            &preds,
            &baseline,
            &Attribute::Race.lookup_table(),
            &MetricOptions::default(),
        )
        .unwrap_err();
        match err {
            FairnessError::UnknownCategoryCode {
                attribute,
                code,
                stay_id,
            } => {
                assert_eq!(attribute, Attribute::Race);
                assert_eq!(code, 42);
                assert_eq!(stay_id, 2);
            }
            other => panic!("Expected UnknownCategoryCode, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_codes_are_rejected_when_building_a_table() {
        let err = CodeLookupTable::new(Attribute::Gender, [(1, "Male"), (1, "Female")]).unwrap_err();
        assert!(matches!(err, FairnessError::DuplicateCode { code: 1, .. }));
    }

    #[test]
    fn single_class_bucket_reports_undefined_without_aborting_siblings() {
        // Stays 2 and 4 are even, so their hospital-mortality truth is 0 only.
        let (preds, baseline) = tables(&[(2, 3), (4, 3), (1, 4), (3, 4), (6, 4)]);
        let report = stratify(
            &preds,
            &baseline,
            &Attribute::Race.lookup_table(),
            &MetricOptions::default(),
        )
        .unwrap();
        assert_eq!(report.buckets.len(), 2);

        let asian = &report.buckets[0];
        assert_eq!(asian.label, "Asian");
        let hosp = &asian.metrics[0];
        assert_eq!(hosp.head, Head::HospitalMortality);
        assert_eq!(hosp.result.recall, MetricValue::Undefined);
        assert_eq!(hosp.result.auc, MetricValue::Undefined);
        assert!(hosp.result.accuracy.is_defined());
        assert!(asian.insufficient_heads().contains(&Head::HospitalMortality));

        let white = &report.buckets[1];
        assert!(white.metrics[0].result.auc.is_defined());
    }

    #[test]
    fn audit_all_reports_every_attribute_in_order() {
        let rows: Vec<(i64, i64)> = (1..=12).map(|id| (id, 1 + id % 8)).collect();
        let (preds, baseline) = tables(&rows);
        let reports =
            audit_all(&preds, &baseline, &Attribute::ALL, &MetricOptions::default()).unwrap();
        let order: Vec<Attribute> = reports.iter().map(|r| r.attribute).collect();
        assert_eq!(order, Attribute::ALL.to_vec());
        for report in &reports {
            let total: usize = report.buckets.iter().map(|b| b.len()).sum();
            assert_eq!(total, 12);
            assert!(report.buckets.iter().all(|b| b.metrics.len() == Head::ACTIVE.len()));
        }
    }
}
