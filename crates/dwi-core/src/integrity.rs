//! Integrity cross-checks
//!
//! Compares image volume count, gradient value count, direction table shape
//! and the number of b0 volumes. Findings are informational: they are logged
//! and reported, never returned as errors.

use serde::{Deserialize, Serialize};

use crate::error::IntegrityMismatch;
use crate::invoke::Scope;
use crate::sanitize::{GradientTable, SanitizedGradients};
use crate::tools::ImageTools;
use crate::types::ImageSeries;

/// Measurements plus findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Image volumes, when readable
    pub volumes: Option<usize>,
    /// Entries in the value table
    pub bval_count: usize,
    /// Direction table rows
    pub bvec_rows: usize,
    /// Direction table columns
    pub bvec_cols: usize,
    /// Values below the b0 threshold
    pub b0_count: usize,
    /// Volume used as b0 reference
    pub b0_index: usize,
    /// Findings, rendered
    pub mismatches: Vec<String>,
}

impl IntegrityReport {
    /// No findings
    #[inline]
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Lines for the diagnostic log
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let volumes = self
            .volumes
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let mut lines = vec![
            format!("volumes: {volumes}"),
            format!("bval entries: {}", self.bval_count),
            format!("bvec shape: {}x{}", self.bvec_rows, self.bvec_cols),
            format!("b0 volumes: {} (first at {})", self.b0_count, self.b0_index),
        ];
        lines.extend(self.mismatches.iter().map(|m| format!("mismatch: {m}")));
        lines
    }
}

/// Cross-validates a subject's inputs
#[derive(Debug, Clone, Copy)]
pub struct IntegrityChecker {
    b0_threshold: f64,
}

impl IntegrityChecker {
    /// Checker counting values below `b0_threshold` as b0
    #[must_use]
    pub fn new(b0_threshold: f64) -> Self {
        Self { b0_threshold }
    }

    /// Pure comparison of already-read measurements
    #[must_use]
    pub fn check(&self, table: &GradientTable, image: &ImageSeries) -> (IntegrityReport, Vec<IntegrityMismatch>) {
        let bval_count = table.values.len();
        let shape = table.directions;
        let b0_count = table.b0_count(self.b0_threshold);

        let mut findings = Vec::new();
        match image.volumes {
            Some(volumes) if volumes != bval_count => {
                findings.push(IntegrityMismatch::VolumeCount {
                    volumes,
                    values: bval_count,
                });
            }
            Some(_) => {}
            None => findings.push(IntegrityMismatch::VolumeCountUnavailable(
                image.path.display().to_string(),
            )),
        }
        if shape.rows != 3 || shape.cols != bval_count {
            findings.push(IntegrityMismatch::DirectionShape {
                rows: shape.rows,
                cols: shape.cols,
                expected: bval_count,
            });
        }
        if b0_count == 0 {
            findings.push(IntegrityMismatch::NoB0Volumes {
                threshold: self.b0_threshold,
            });
        }

        let report = IntegrityReport {
            volumes: image.volumes,
            bval_count,
            bvec_rows: shape.rows,
            bvec_cols: shape.cols,
            b0_count,
            b0_index: table.b0_index(self.b0_threshold),
            mismatches: findings.iter().map(ToString::to_string).collect(),
        };
        (report, findings)
    }

    /// Read the volume count and the sanitized tables, then compare
    ///
    /// Unreadable inputs become findings; this never fails.
    pub async fn run(
        &self,
        tools: &dyn ImageTools,
        image: &std::path::Path,
        gradients: &SanitizedGradients,
        scope: &Scope,
    ) -> (IntegrityReport, GradientTable) {
        let volumes = match tools.volume_count(image, scope).await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!("volume count unavailable: {e}");
                None
            }
        };
        let series = ImageSeries {
            path: image.to_path_buf(),
            volumes,
        };

        let table = GradientTable::load(&gradients.bval, &gradients.bvec).unwrap_or_else(|e| {
            tracing::warn!("gradient tables unreadable: {e}");
            GradientTable {
                values: Vec::new(),
                directions: crate::sanitize::TableShape { rows: 0, cols: 0 },
            }
        });

        let (report, findings) = self.check(&table, &series);
        for finding in &findings {
            tracing::warn!(%finding, "integrity mismatch");
        }
        (report, table)
    }
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new(crate::config::FallbackParams::default().b0_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::sanitize::TableShape;
    use crate::tools::MockImageTools;
    use std::path::{Path, PathBuf};

    fn table(values: Vec<f64>, rows: usize, cols: usize) -> GradientTable {
        GradientTable {
            values,
            directions: TableShape { rows, cols },
        }
    }

    fn series(volumes: Option<usize>) -> ImageSeries {
        ImageSeries {
            path: PathBuf::from("/d/s/dwi.nii.gz"),
            volumes,
        }
    }

    #[test]
    fn consistent_inputs_have_no_findings() {
        let (report, findings) = IntegrityChecker::default()
            .check(&table(vec![0.0, 1000.0, 1000.0], 3, 3), &series(Some(3)));
        assert!(findings.is_empty());
        assert!(report.is_consistent());
        assert_eq!(report.b0_count, 1);
        assert_eq!(report.b0_index, 0);
    }

    #[test]
    fn every_mismatch_reported() {
        let (report, findings) = IntegrityChecker::default()
            .check(&table(vec![1000.0, 1000.0], 2, 3), &series(Some(5)));
        assert_eq!(
            findings,
            vec![
                IntegrityMismatch::VolumeCount { volumes: 5, values: 2 },
                IntegrityMismatch::DirectionShape { rows: 2, cols: 3, expected: 2 },
                IntegrityMismatch::NoB0Volumes { threshold: 50.0 },
            ]
        );
        assert_eq!(report.lines().len(), 4 + 3);
    }

    #[tokio::test]
    async fn unreadable_volume_count_is_a_finding() {
        let dir = tempfile::tempdir().unwrap();
        let bval = dir.path().join("s_sanitized.bval");
        let bvec = dir.path().join("s_sanitized.bvec");
        std::fs::write(&bval, "0 1000\n").unwrap();
        std::fs::write(&bvec, "1 0\n0 1\n0 0\n").unwrap();
        let gradients = SanitizedGradients {
            bval,
            bvec,
            transposed: false,
            ignored: Vec::new(),
        };

        let mut tools = MockImageTools::new();
        tools
            .expect_volume_count()
            .returning(|_, _| Err(PipelineError::fallback("fslval", "exit 127")));

        let (report, table) = IntegrityChecker::default()
            .run(&tools, Path::new("/d/s/dwi.nii.gz"), &gradients, &Scope::new("/d/s", "/d/s/x"))
            .await;
        assert_eq!(report.volumes, None);
        assert_eq!(table.values, vec![0.0, 1000.0]);
        assert_eq!(report.mismatches.len(), 1);
    }
}
