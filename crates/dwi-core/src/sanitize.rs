//! Gradient table sanitization
//!
//! Produces sanitized copies of the value and direction tables; originals
//! are never touched. Carriage-return stripping is best-effort: its failure
//! is logged and ignored, the copy stays usable as-is.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::types::{ResolvedFiles, SubjectLayout};

/// Rows x columns of a whitespace-separated text table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableShape {
    /// Non-empty lines
    pub rows: usize,
    /// Tokens on the first non-empty line
    pub cols: usize,
}

/// Shape of a table, as line count and first-line column count
#[must_use]
pub fn table_shape(text: &str) -> TableShape {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let cols = lines
        .next()
        .map(|l| l.split_whitespace().count())
        .unwrap_or(0);
    let rows = text.lines().filter(|l| !l.trim().is_empty()).count();
    TableShape { rows, cols }
}

/// Remove trailing `\r` from every line
#[must_use]
pub fn strip_carriage_returns(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        out.push_str(body.trim_end_matches('\r'));
        out.push_str(newline);
    }
    out
}

/// Reorient an N x 3 direction table to 3 x N
///
/// Returns `None` when the table is already 3 rows, not 3 columns wide, or
/// ragged.
#[must_use]
pub fn orient_directions(text: &str) -> Option<String> {
    let shape = table_shape(text);
    if shape.rows == 3 || shape.cols != 3 {
        return None;
    }

    let rows: Vec<Vec<&str>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split_whitespace().collect())
        .collect();
    if rows.iter().any(|r| r.len() != 3) {
        return None;
    }

    let mut out = String::new();
    for axis in 0..3 {
        let line: Vec<&str> = rows.iter().map(|r| r[axis]).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    Some(out)
}

/// Gradient values as numbers, one per token; unparsable tokens become NaN
#[must_use]
pub fn parse_values(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .map(|t| t.parse::<f64>().unwrap_or(f64::NAN))
        .collect()
}

/// Position of the first value below `threshold`
#[must_use]
pub fn first_b0_index(values: &[f64], threshold: f64) -> Option<usize> {
    values.iter().position(|v| *v < threshold)
}

/// Loaded, sanitized gradient table
#[derive(Debug, Clone, PartialEq)]
pub struct GradientTable {
    /// Values in acquisition order
    pub values: Vec<f64>,
    /// Direction table shape
    pub directions: TableShape,
}

impl GradientTable {
    /// Load from sanitized files
    pub fn load(bval: &Path, bvec: &Path) -> Result<Self, PipelineError> {
        let values = fs::read_to_string(bval).map_err(|e| PipelineError::io(bval, e))?;
        let directions = fs::read_to_string(bvec).map_err(|e| PipelineError::io(bvec, e))?;
        Ok(Self {
            values: parse_values(&values),
            directions: table_shape(&directions),
        })
    }

    /// Volume used as the b0 reference; volume 0 when no value is below threshold
    #[inline]
    #[must_use]
    pub fn b0_index(&self, threshold: f64) -> usize {
        first_b0_index(&self.values, threshold).unwrap_or(0)
    }

    /// Number of near-zero-diffusion volumes
    #[must_use]
    pub fn b0_count(&self, threshold: f64) -> usize {
        self.values.iter().filter(|v| **v < threshold).count()
    }
}

/// Paths of the sanitized copies plus what was done to them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedGradients {
    /// Sanitized values
    pub bval: PathBuf,
    /// Sanitized directions
    pub bvec: PathBuf,
    /// Direction table was transposed
    pub transposed: bool,
    /// Best-effort steps that failed and were ignored
    pub ignored: Vec<String>,
}

/// Copies and normalizes gradient tables
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer;

impl Sanitizer {
    /// Create sanitizer
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Write sanitized copies into the subject's output directory
    ///
    /// # Errors
    /// Copy failures are fatal for the subject; carriage-return stripping
    /// failures are recorded in `ignored` and otherwise swallowed.
    pub fn sanitize(
        &self,
        files: &ResolvedFiles,
        layout: &SubjectLayout,
    ) -> Result<SanitizedGradients, PipelineError> {
        fs::create_dir_all(layout.root()).map_err(|e| PipelineError::io(layout.root(), e))?;

        let bval = layout.sanitized(&files.bval);
        let bvec = layout.sanitized(&files.bvec);
        fs::copy(&files.bval, &bval).map_err(|e| PipelineError::io(&files.bval, e))?;
        fs::copy(&files.bvec, &bvec).map_err(|e| PipelineError::io(&files.bvec, e))?;

        let mut ignored = Vec::new();
        for path in [&bval, &bvec] {
            if let Err(e) = rewrite(path, |text| Some(strip_carriage_returns(text))) {
                tracing::debug!("ignored: carriage-return stripping on {}: {}", path.display(), e);
                ignored.push(format!("strip_cr {}: {e}", path.display()));
            }
        }

        let transposed = rewrite(&bvec, orient_directions).map_err(|e| PipelineError::io(&bvec, e))?;
        if transposed {
            tracing::info!("transposed direction table {}", bvec.display());
        }

        Ok(SanitizedGradients {
            bval,
            bvec,
            transposed,
            ignored,
        })
    }
}

/// Apply `f` to a text file in place; returns whether it was rewritten
fn rewrite(path: &Path, f: impl FnOnce(&str) -> Option<String>) -> std::io::Result<bool> {
    let text = fs::read_to_string(path)?;
    match f(&text) {
        Some(updated) if updated != text => {
            fs::write(path, updated)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_crlf() {
        assert_eq!(strip_carriage_returns("0 1000\r\n0 1 0\r\n"), "0 1000\n0 1 0\n");
        assert_eq!(strip_carriage_returns("0 1000\r"), "0 1000");
    }

    #[test]
    fn transposes_n_by_3() {
        let text = "1 0 0\n0 1 0\n0 0 1\n1 1 0\n";
        let out = orient_directions(text).unwrap();
        assert_eq!(out, "1 0 0 1\n0 1 0 1\n0 0 1 0\n");
    }

    #[test]
    fn three_by_n_untouched() {
        assert_eq!(orient_directions("1 0 0 1\n0 1 0 1\n0 0 1 0\n"), None);
        // 3x3 is ambiguous and left as-is
        assert_eq!(orient_directions("1 0 0\n0 1 0\n0 0 1\n"), None);
    }

    #[test]
    fn ragged_table_untouched() {
        assert_eq!(orient_directions("1 0 0\n0 1\n0 0 1\n1 1 0\n"), None);
    }

    #[test]
    fn first_b0_defaults_to_zero() {
        let table = GradientTable {
            values: vec![1000.0, 1000.0, 5.0, 0.0],
            directions: TableShape { rows: 3, cols: 4 },
        };
        assert_eq!(table.b0_index(50.0), 2);
        assert_eq!(table.b0_count(50.0), 2);

        let none = GradientTable {
            values: vec![1000.0, 2000.0],
            directions: TableShape { rows: 3, cols: 2 },
        };
        assert_eq!(none.b0_index(50.0), 0);
    }

    #[test]
    fn sanitize_writes_copies_only() {
        let dir = tempfile::tempdir().unwrap();
        let bval = dir.path().join("s.bval");
        let bvec = dir.path().join("s.bvec");
        fs::write(&bval, "0 1000 1000\r\n").unwrap();
        fs::write(&bvec, "1 0 0\r\n0 1 0\r\n0 0 1\r\n1 1 1\r\n").unwrap();
        let files = ResolvedFiles {
            bval: bval.clone(),
            bvec: bvec.clone(),
            image: dir.path().join("s.nii.gz"),
        };
        let layout = SubjectLayout::new(dir.path());

        let out = Sanitizer::new().sanitize(&files, &layout).unwrap();

        assert!(out.transposed);
        assert!(out.ignored.is_empty());
        assert_eq!(fs::read_to_string(&out.bval).unwrap(), "0 1000 1000\n");
        assert_eq!(fs::read_to_string(&out.bvec).unwrap(), "1 0 0 1\n0 1 0 1\n0 0 1 1\n");
        // originals untouched
        assert_eq!(fs::read_to_string(&bval).unwrap(), "0 1000 1000\r\n");

        // second pass over an already oriented table changes nothing
        let again = Sanitizer::new().sanitize(&files, &layout).unwrap();
        assert_eq!(fs::read_to_string(&again.bvec).unwrap(), "1 0 0 1\n0 1 0 1\n0 0 1 1\n");
    }

    fn matrix(rows: usize, cols: usize) -> String {
        (0..rows)
            .map(|r| {
                (0..cols)
                    .map(|c| (r * cols + c).to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    proptest! {
        #[test]
        fn n_by_3_becomes_3_by_n(n in 1usize..200) {
            prop_assume!(n != 3);
            let out = orient_directions(&matrix(n, 3)).unwrap();
            prop_assert_eq!(table_shape(&out), TableShape { rows: 3, cols: n });
        }

        #[test]
        fn oriented_table_is_fixed_point(n in 1usize..200) {
            let text = matrix(3, n);
            prop_assert_eq!(orient_directions(&text), None);
        }

        #[test]
        fn b0_index_is_first_below_threshold(values in proptest::collection::vec(0.0f64..3000.0, 0..64)) {
            let expected = values.iter().position(|v| *v < 50.0);
            prop_assert_eq!(first_b0_index(&values, 50.0), expected);
            let table = GradientTable {
                values: values.clone(),
                directions: TableShape { rows: 3, cols: values.len() },
            };
            prop_assert_eq!(table.b0_index(50.0), expected.unwrap_or(0));
        }
    }
}
