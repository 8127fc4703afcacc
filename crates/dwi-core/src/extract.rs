//! Result extraction from captured engine text
//!
//! The engine reports its scalar as `<label> is <number>`; the last match in
//! the text wins, so repeated lines in verbose output resolve to the final one.

use std::path::Path;

use regex::Regex;

use crate::error::PipelineError;

/// Parses `<label> is <number>` lines
#[derive(Debug, Clone)]
pub struct ResultExtractor {
    pattern: Regex,
}

impl ResultExtractor {
    /// Extractor for `label`, matched case-sensitively as a whole word
    #[must_use]
    pub fn new(label: &str) -> Self {
        // A partial number ("2.45e", "2.45.3") must not match at all.
        let pattern = format!(
            r"\b{}\s+is\s+([-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)(?:$|[\s,;)]|\.(?:$|\s))",
            regex::escape(label.trim())
        );
        // The label is escaped, so the pattern is always valid.
        let pattern = Regex::new(&pattern).expect("escaped result pattern");
        Self { pattern }
    }

    /// Scalar from the last matching line
    ///
    /// # Errors
    /// `NoResultFound` when no line matches.
    pub fn extract(&self, text: &str) -> Result<f64, PipelineError> {
        text.lines()
            .rev()
            .find_map(|line| {
                self.pattern
                    .captures_iter(line)
                    .last()
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
            })
            .ok_or(PipelineError::NoResultFound)
    }

    /// Whether `text` holds a well-formed result line
    #[inline]
    #[must_use]
    pub fn has_result(&self, text: &str) -> bool {
        self.extract(text).is_ok()
    }

    /// Scalar from a log file
    pub fn extract_file(&self, path: &Path) -> Result<f64, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        self.extract(&String::from_utf8_lossy(&bytes))
    }
}

impl Default for ResultExtractor {
    fn default() -> Self {
        Self::new("result")
    }
}
