//! Aggregate CSV report
//!
//! One row per subject, discovery order. The method column is re-derived
//! from the stage logs: a primary log with a result wins over a fallback log
//! with a result; neither means `fail`. The file is written to a temp file
//! beside the destination and renamed into place.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::classify::classify_text;
use crate::config::EngineMode;
use crate::error::BatchError;
use crate::extract::ResultExtractor;
use crate::types::{Method, OutcomeRecord};

/// Default report file name under the batch root
pub const REPORT_FILE_NAME: &str = "batch_results.csv";

/// `<root>/batch_results.csv`
#[must_use]
pub fn default_report_path(root: &Path) -> PathBuf {
    root.join(REPORT_FILE_NAME)
}

/// One CSV row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    /// Subject id
    pub subject: String,
    /// Primary mode of the run
    pub mode: EngineMode,
    /// Method derived from the logs
    pub method: Method,
    /// Scalar, empty when `fail`
    pub value: Option<f64>,
    /// Primary log path
    pub primary_log: Option<PathBuf>,
    /// Fallback log path
    pub fallback_log: Option<PathBuf>,
    /// Diagnostic log path
    pub diagnostic_log: Option<PathBuf>,
}

/// Method and scalar from the stage logs
#[must_use]
pub fn classify_method(
    primary_log: Option<&Path>,
    fallback_log: Option<&Path>,
    extractor: &ResultExtractor,
) -> (Method, Option<f64>) {
    let value_of = |log: Option<&Path>| {
        let text = std::fs::read(log?).ok()?;
        classify_text(&String::from_utf8_lossy(&text), extractor).value()
    };
    if let Some(v) = value_of(primary_log) {
        return (Method::Primary, Some(v));
    }
    if let Some(v) = value_of(fallback_log) {
        return (Method::Fallback, Some(v));
    }
    (Method::Fail, None)
}

/// Folds outcome records into the aggregate report
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    extractor: ResultExtractor,
}

impl ResultAggregator {
    /// Aggregator reading results with `extractor`
    #[must_use]
    pub fn new(extractor: ResultExtractor) -> Self {
        Self { extractor }
    }

    /// Rows in record order
    #[must_use]
    pub fn rows(&self, records: &[OutcomeRecord]) -> Vec<ReportRow> {
        records
            .iter()
            .map(|r| {
                let (method, value) =
                    classify_method(r.primary_log.as_deref(), r.fallback_log.as_deref(), &self.extractor);
                if method != r.method {
                    tracing::warn!(
                        subject = %r.subject,
                        pipeline = %r.method,
                        logs = %method,
                        "log-derived method differs from pipeline outcome"
                    );
                }
                ReportRow {
                    subject: r.subject.clone(),
                    mode: r.mode,
                    method,
                    value,
                    primary_log: r.primary_log.clone(),
                    fallback_log: r.fallback_log.clone(),
                    diagnostic_log: r.diagnostic_log.clone(),
                }
            })
            .collect()
    }

    /// Write `rows` to `path` atomically
    ///
    /// # Errors
    /// `Report` when the temp file cannot be created, written or renamed.
    pub fn write(&self, path: &Path, rows: &[ReportRow]) -> Result<(), BatchError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| report_error(path, e))?;
        let mut writer = csv::Writer::from_writer(tmp);
        for row in rows {
            writer.serialize(row).map_err(|e| report_error(path, e))?;
        }
        if rows.is_empty() {
            writer.write_record(HEADER).map_err(|e| report_error(path, e))?;
        }
        let tmp = writer.into_inner().map_err(|e| report_error(path, e))?;
        tmp.persist(path).map_err(|e| report_error(path, e.error))?;

        tracing::info!(rows = rows.len(), "report written to {}", path.display());
        Ok(())
    }

    /// Rows from `records`, written to `path`
    pub fn aggregate(&self, records: &[OutcomeRecord], path: &Path) -> Result<Vec<ReportRow>, BatchError> {
        let rows = self.rows(records);
        self.write(path, &rows)?;
        Ok(rows)
    }
}

fn report_error(path: &Path, e: impl std::fmt::Display) -> BatchError {
    BatchError::Report(format!("{}: {e}", path.display()))
}

/// Column names
pub const HEADER: [&str; 7] = [
    "subject",
    "mode",
    "method",
    "value",
    "primary_log",
    "fallback_log",
    "diagnostic_log",
];
