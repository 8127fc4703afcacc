//! Engine outcome classification
//!
//! Maps (exit status, captured text) to a tagged outcome by fixed precedence:
//! 1. a known failure marker in the text is a failure
//! 2. text without a well-formed result line is a failure
//! 3. otherwise success; the exit status is only a secondary signal
//!
//! Text dominates exit status in both directions.

use serde::{Deserialize, Serialize};

use crate::extract::ResultExtractor;

/// Substrings that mark an aborted or input-starved engine run
pub const FAILURE_MARKERS: &[&str] = &[
    "Abort",
    "Image Exception",
    "No such file or directory",
    "does not exist",
    "Cannot open",
    "cannot open",
    "command not found",
    "Segmentation fault",
    "Killed",
];

/// Why an engine attempt failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Captured text matched a failure marker
    Marker(String),
    /// No result line in the captured text
    NoResult,
    /// Primary mode skipped: dependency missing
    DependencyUnavailable(String),
    /// Process could not be launched
    Launch(String),
    /// Fallback tool chain broke before the engine ran
    Computation(String),
    /// Stage log could not be written
    Io(String),
}

impl FailureReason {
    /// Short tag
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Marker(_) => "failure_marker",
            FailureReason::NoResult => "no_result_found",
            FailureReason::DependencyUnavailable(_) => "dependency_unavailable",
            FailureReason::Launch(_) => "engine_invocation_failure",
            FailureReason::Computation(_) => "fallback_computation_failure",
            FailureReason::Io(_) => "io",
        }
    }
}

/// Tagged engine outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineOutcome {
    /// Scalar extracted
    Success(f64),
    /// No usable scalar
    Failure(FailureReason),
}

impl EngineOutcome {
    /// Scalar, if successful
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        match self {
            EngineOutcome::Success(v) => Some(*v),
            EngineOutcome::Failure(_) => None,
        }
    }

    /// Whether successful
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, EngineOutcome::Success(_))
    }

    /// Failure tag, if failed
    #[must_use]
    pub fn failure_code(&self) -> Option<&'static str> {
        match self {
            EngineOutcome::Success(_) => None,
            EngineOutcome::Failure(reason) => Some(reason.code()),
        }
    }
}

/// First failure marker present in `text`
#[must_use]
pub fn failure_marker(text: &str) -> Option<&'static str> {
    FAILURE_MARKERS.iter().copied().find(|m| text.contains(m))
}

/// Classify from text only (rules 1 and 2, then success)
#[must_use]
pub fn classify_text(text: &str, extractor: &ResultExtractor) -> EngineOutcome {
    if let Some(marker) = failure_marker(text) {
        return EngineOutcome::Failure(FailureReason::Marker(marker.to_string()));
    }
    match extractor.extract(text) {
        Ok(value) => EngineOutcome::Success(value),
        Err(_) => EngineOutcome::Failure(FailureReason::NoResult),
    }
}

/// Classify an engine run
#[must_use]
pub fn classify(exit_code: Option<i32>, text: &str, extractor: &ResultExtractor) -> EngineOutcome {
    let outcome = classify_text(text, extractor);
    if outcome.is_success() && exit_code != Some(0) {
        tracing::warn!(?exit_code, "engine printed a result but exited non-zero; keeping result");
    }
    outcome
}
