//! Error types for the DWI orchestrator
//!
//! Two families with different blast radius:
//! - `PipelineError`: local to one subject, always folded into a `fail` outcome
//! - `BatchError`: pre-flight failures that abort the whole run
//!
//! Integrity findings are not errors at all; see `IntegrityMismatch`.

use std::path::PathBuf;

use crate::state::SubjectState;

/// Subject-local pipeline error
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A required input file is absent
    #[error("missing file: {what} in {}", dir.display())]
    MissingFile {
        /// What was being looked for
        what: &'static str,
        /// Directory that was searched
        dir: PathBuf,
    },

    /// No image distinguishable from gradient metadata
    #[error("no diffusion image found in {}", .0.display())]
    NiftiNotFound(PathBuf),

    /// Filesystem error on a subject-owned file
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A dependency of the primary mode is missing from the engine environment
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// The engine could not be launched or reported failure
    #[error("engine invocation failed: {0}")]
    EngineInvocationFailure(String),

    /// No skeleton mask could be supplied, inherited or fetched
    #[error("mask acquisition failed: {0}")]
    MaskAcquisitionFailure(String),

    /// An external tool in the fallback sequence failed
    #[error("fallback computation failed in {tool}: {message}")]
    FallbackComputationFailure {
        /// Tool that failed
        tool: &'static str,
        /// Captured reason
        message: String,
    },

    /// Log text carries no well-formed result line
    #[error("no result found")]
    NoResultFound,

    /// State machine refused a transition
    #[error("illegal state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: SubjectState,
        /// Requested state
        to: SubjectState,
    },
}

impl PipelineError {
    /// Wrap an i/o error with the path it happened on
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fallback tool failure
    #[inline]
    pub fn fallback(tool: &'static str, message: impl Into<String>) -> Self {
        Self::FallbackComputationFailure {
            tool,
            message: message.into(),
        }
    }

    /// Stable tag for logs and JSON summaries
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingFile { .. } => "missing_file",
            Self::NiftiNotFound(_) => "nifti_not_found",
            Self::Io { .. } => "io",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::EngineInvocationFailure(_) => "engine_invocation_failure",
            Self::MaskAcquisitionFailure(_) => "mask_acquisition_failure",
            Self::FallbackComputationFailure { .. } => "fallback_computation_failure",
            Self::NoResultFound => "no_result_found",
            Self::IllegalTransition { .. } => "illegal_transition",
        }
    }

    /// Whether the error happened before any engine work was attempted
    #[inline]
    #[must_use]
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::MissingFile { .. }
                | Self::NiftiNotFound(_)
                | Self::Io { .. }
                | Self::MaskAcquisitionFailure(_)
        )
    }
}

/// Fatal, run-level errors
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Target is not a directory
    #[error("invalid root: {} is not a directory", .0.display())]
    InvalidRoot(PathBuf),

    /// Nothing under the root validated as a subject
    #[error("no valid subjects under {}", .0.display())]
    NoValidSubjects(PathBuf),

    /// Configuration rejected by validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Aggregate report could not be written
    #[error("report error: {0}")]
    Report(String),

    /// Filesystem error outside any subject
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Process exit code for this error
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoValidSubjects(_) => 3,
            Self::InvalidRoot(_) | Self::Config(_) => 2,
            Self::Report(_) | Self::Io(_) => 1,
        }
    }
}

/// Informational integrity findings; never abort the pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegrityMismatch {
    /// Image volumes and gradient values disagree
    #[error("volume count {volumes} != gradient value count {values}")]
    VolumeCount {
        /// Volumes in the image
        volumes: usize,
        /// Entries in the value table
        values: usize,
    },

    /// Direction table is not 3 x N with N = value count
    #[error("direction table is {rows}x{cols}, expected 3x{expected}")]
    DirectionShape {
        /// Rows
        rows: usize,
        /// Columns of the first row
        cols: usize,
        /// Expected column count
        expected: usize,
    },

    /// No near-zero-diffusion volume at all
    #[error("no b0 volume below threshold {threshold}")]
    NoB0Volumes {
        /// Threshold used
        threshold: f64,
    },

    /// Image volume count could not be read
    #[error("volume count unavailable: {0}")]
    VolumeCountUnavailable(String),
}
