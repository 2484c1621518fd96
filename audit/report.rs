//! # Report Rendering
//!
//! Training, checkpoint evaluation and the fairness sweep hand their results
//! to a [`ReportRenderer`]. The bundled [`TsvReportWriter`] writes
//! tab-separated artifacts that any plotting tool can pick up:
//!
//! ```text
//! <root>/fold<i>/val_acc.tsv               per-epoch loss and accuracy
//! <root>/fold<i>/metrics.tsv               final-epoch battery per head
//! <root>/fold<i>/confusion_matrix.tsv
//! <root>/fold<i>/roc_curve_<head>.tsv
//! <root>/fold<i>/calibration_curve_<head>.tsv
//! <root>/...                               same battery files for a test run
//! <root>/fairness/<attribute>/metrics.tsv  one row per bucket and head
//! <root>/fairness/<attribute>/roc_<bucket>.tsv
//! ```
//!
//! Undefined metrics are written as `NA`.

use crate::fairness::AttributeReport;
use crate::heads::Head;
use crate::metrics::{HeadMetrics, MetricValue, MetricsResult};
use crate::train::{FoldReport, RunRecord};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write tab-separated report: {0}")]
    CsvError(#[from] csv::Error),
}

/// Receives finished results. Every method defaults to doing nothing.
pub trait ReportRenderer {
    fn render_fold(&mut self, report: &FoldReport) -> Result<(), ReportError> {
        let _ = report;
        Ok(())
    }
    fn render_run(&mut self, record: &RunRecord) -> Result<(), ReportError> {
        let _ = record;
        Ok(())
    }
    fn render_fairness(&mut self, report: &AttributeReport) -> Result<(), ReportError> {
        let _ = report;
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopRenderer;

impl ReportRenderer for NoopRenderer {}

/// Writes every report as TSV files below `root`.
#[derive(Debug, Clone)]
pub struct TsvReportWriter {
    root: PathBuf,
}

impl TsvReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ReportRenderer for TsvReportWriter {
    fn render_fold(&mut self, report: &FoldReport) -> Result<(), ReportError> {
        let dir = self.root.join(format!("fold{}", report.fold));
        fs::create_dir_all(&dir)?;

        let mut writer = tsv_writer(&dir.join("val_acc.tsv"))?;
        let mut header = vec!["epoch".to_string(), "train_loss".to_string(), "val_loss".to_string()];
        for head in Head::ACTIVE {
            header.push(format!("train_acc_{head}"));
        }
        for head in Head::ACTIVE {
            header.push(format!("val_acc_{head}"));
        }
        header.push("score".to_string());
        header.push("improved".to_string());
        writer.write_record(&header)?;
        for record in &report.history {
            let mut row = vec![
                record.epoch.to_string(),
                fmt_metric(record.train.loss),
                fmt_metric(record.validation.loss),
            ];
            row.extend(record.train.accuracy.iter().map(|&a| fmt_metric(a)));
            row.extend(record.validation.accuracy.iter().map(|&a| fmt_metric(a)));
            row.push(fmt_metric(record.score));
            row.push(record.improved.to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;

        write_battery(&dir, report.final_metrics())?;
        log::info!("Fold {} summary (final epoch):", report.fold);
        for m in report.final_metrics() {
            log::info!("  {}: {}", m.head, m.result);
        }
        Ok(())
    }

    fn render_run(&mut self, record: &RunRecord) -> Result<(), ReportError> {
        fs::create_dir_all(&self.root)?;
        write_battery(&self.root, &record.metrics)?;
        for m in &record.metrics {
            log::info!("{}: {}", m.head, m.result);
        }
        Ok(())
    }

    fn render_fairness(&mut self, report: &AttributeReport) -> Result<(), ReportError> {
        let dir = self.root.join("fairness").join(report.attribute.column());
        fs::create_dir_all(&dir)?;

        let mut writer = tsv_writer(&dir.join("metrics.tsv"))?;
        writer.write_record([
            "bucket",
            "codes",
            "n",
            "head",
            "n_positive",
            "sensitivity",
            "specificity",
            "precision",
            "recall",
            "f1",
            "accuracy",
            "auc",
        ])?;
        for bucket in &report.buckets {
            let codes = bucket
                .codes
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            for m in &bucket.metrics {
                let r = &m.result;
                writer.write_record([
                    bucket.label.clone(),
                    codes.clone(),
                    bucket.len().to_string(),
                    m.head.to_string(),
                    r.n_positive.to_string(),
                    fmt_metric(r.sensitivity),
                    fmt_metric(r.specificity),
                    fmt_metric(r.precision),
                    fmt_metric(r.recall),
                    fmt_metric(r.f1),
                    fmt_metric(r.accuracy),
                    fmt_metric(r.auc),
                ])?;
            }

            let mut roc = tsv_writer(&dir.join(format!("roc_{}.tsv", bucket.label)))?;
            write_roc_rows(&mut roc, &bucket.metrics)?;
            roc.flush()?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<fs::File>, ReportError> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

fn fmt_metric(value: MetricValue) -> String {
    format!("{value:.6}")
}

/// `metrics.tsv`, `confusion_matrix.tsv` and per-head ROC and calibration files.
fn write_battery(dir: &Path, metrics: &[HeadMetrics]) -> Result<(), ReportError> {
    let mut summary = tsv_writer(&dir.join("metrics.tsv"))?;
    summary.write_record([
        "head",
        "n",
        "n_positive",
        "sensitivity",
        "specificity",
        "precision",
        "recall",
        "f1",
        "accuracy",
        "auc",
    ])?;
    let mut confusion = tsv_writer(&dir.join("confusion_matrix.tsv"))?;
    confusion.write_record(["head", "tn", "fp", "fn", "tp"])?;

    for HeadMetrics { head, result } in metrics {
        summary.write_record(summary_row(*head, result))?;
        let c = &result.confusion;
        confusion.write_record([
            head.to_string(),
            c.tn.to_string(),
            c.fp.to_string(),
            c.fn_count.to_string(),
            c.tp.to_string(),
        ])?;

        let mut roc = tsv_writer(&dir.join(format!("roc_curve_{head}.tsv")))?;
        roc.write_record(["fpr", "tpr", "threshold"])?;
        if let Some(curve) = &result.roc {
            for ((fpr, tpr), threshold) in curve.fpr.iter().zip(&curve.tpr).zip(&curve.thresholds) {
                roc.write_record([fpr.to_string(), tpr.to_string(), threshold.to_string()])?;
            }
        }
        roc.flush()?;

        let mut calibration = tsv_writer(&dir.join(format!("calibration_curve_{head}.tsv")))?;
        calibration.write_record(["mean_predicted", "fraction_positive", "count"])?;
        for bin in &result.calibration.bins {
            calibration.write_record([
                bin.mean_predicted.to_string(),
                bin.fraction_positive.to_string(),
                bin.count.to_string(),
            ])?;
        }
        calibration.flush()?;
    }
    summary.flush()?;
    confusion.flush()?;
    Ok(())
}

fn summary_row(head: Head, result: &MetricsResult) -> [String; 10] {
    [
        head.to_string(),
        result.n_samples.to_string(),
        result.n_positive.to_string(),
        fmt_metric(result.sensitivity),
        fmt_metric(result.specificity),
        fmt_metric(result.precision),
        fmt_metric(result.recall),
        fmt_metric(result.f1),
        fmt_metric(result.accuracy),
        fmt_metric(result.auc),
    ]
}

fn write_roc_rows(
    writer: &mut csv::Writer<fs::File>,
    metrics: &[HeadMetrics],
) -> Result<(), ReportError> {
    writer.write_record(["head", "fpr", "tpr", "threshold", "auc"])?;
    for m in metrics {
        let Some(curve) = &m.result.roc else {
            continue;
        };
        let auc = fmt_metric(m.result.auc);
        for ((fpr, tpr), threshold) in curve.fpr.iter().zip(&curve.tpr).zip(&curve.thresholds) {
            writer.write_record([
                m.head.to_string(),
                fpr.to_string(),
                tpr.to_string(),
                threshold.to_string(),
                auc.clone(),
            ])?;
        }
    }
    Ok(())
}
