//! Core types
//!
//! - Subjects and their resolved input files
//! - Per-subject output layout
//! - Outcome records produced once per subject

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EngineMode;

/// Name of the per-subject output directory
pub const OUTPUT_DIR_NAME: &str = "dti_pipeline";

/// Resolved input triplet of one subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedFiles {
    /// Gradient values (`.bval`)
    pub bval: PathBuf,
    /// Gradient directions (`.bvec`)
    pub bvec: PathBuf,
    /// 4D diffusion image
    pub image: PathBuf,
}

/// One subject directory with its resolved inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Directory name
    pub id: String,
    /// Subject directory
    pub dir: PathBuf,
    /// Inputs
    pub files: ResolvedFiles,
}

impl Subject {
    /// Create subject, naming it after its directory
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, files: ResolvedFiles) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Self { id, dir, files }
    }

    /// Output layout under this subject's directory
    #[inline]
    #[must_use]
    pub fn layout(&self) -> SubjectLayout {
        SubjectLayout::new(&self.dir)
    }
}

/// 4D image reference; the volume count is read, never recomputed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSeries {
    /// Image path
    pub path: PathBuf,
    /// Fourth dimension, when it could be read
    pub volumes: Option<usize>,
}

/// Paths of every artefact a subject writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectLayout {
    root: PathBuf,
}

impl SubjectLayout {
    /// Layout under `subject_dir/dti_pipeline`
    #[must_use]
    pub fn new(subject_dir: &Path) -> Self {
        Self {
            root: subject_dir.join(OUTPUT_DIR_NAME),
        }
    }

    /// Output root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Engine working-directory override
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Fallback artefacts
    #[must_use]
    pub fn fallback_dir(&self) -> PathBuf {
        self.root.join("fallback")
    }

    /// Sanitized copy of an input table: `<stem>_sanitized.<ext>`
    #[must_use]
    pub fn sanitized(&self, original: &Path) -> PathBuf {
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = original
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.join(format!("{stem}_sanitized.{ext}"))
    }

    /// Timestamped diagnostic log
    #[must_use]
    pub fn diagnostic_log(&self, stamp: &str) -> PathBuf {
        self.root.join(format!("diagnostic_{stamp}.log"))
    }

    /// Primary-mode log
    #[must_use]
    pub fn primary_log(&self, mode: EngineMode) -> PathBuf {
        self.root.join(format!("primary_{}.log", mode.as_str()))
    }

    /// Fallback log
    #[must_use]
    pub fn fallback_log(&self) -> PathBuf {
        self.root.join("fallback.log")
    }

    /// Dependency precheck output
    #[must_use]
    pub fn precheck_file(&self) -> PathBuf {
        self.root.join("dependency_check.txt")
    }

    /// Active skeleton mask copy
    #[must_use]
    pub fn skeleton_mask(&self) -> PathBuf {
        self.root.join("skeleton_mask.nii.gz")
    }
}

/// How a subject's scalar was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Engine in direct/preprocessing mode
    Primary,
    /// Mask derivation + tensor fit + from-maps engine run
    Fallback,
    /// No scalar
    Fail,
}

impl Method {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Primary => "primary",
            Method::Fallback => "fallback",
            Method::Fail => "fail",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of one subject; created once, never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Subject id
    pub subject: String,
    /// Subject directory
    pub subject_dir: PathBuf,
    /// Primary mode configured for the run
    pub mode: EngineMode,
    /// Method that produced the value
    pub method: Method,
    /// Extracted scalar
    pub value: Option<f64>,
    /// Primary-mode log, if written
    pub primary_log: Option<PathBuf>,
    /// Fallback log, if written
    pub fallback_log: Option<PathBuf>,
    /// Diagnostic log, if it could be created
    pub diagnostic_log: Option<PathBuf>,
    /// Reason tag when `method` is `fail`
    pub failure: Option<String>,
}

impl OutcomeRecord {
    /// Failed record with no logs, e.g. for a panicked task
    #[must_use]
    pub fn failed(subject: &Subject, mode: EngineMode, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.id.clone(),
            subject_dir: subject.dir.clone(),
            mode,
            method: Method::Fail,
            value: None,
            primary_log: None,
            fallback_log: None,
            diagnostic_log: None,
            failure: Some(reason.into()),
        }
    }

    /// Final status line written to the diagnostic log
    #[must_use]
    pub fn status_line(&self) -> String {
        let value = self
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "NA".to_string());
        format!("STATUS {} method={} value={}", self.subject, self.method, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> Subject {
        Subject::new(
            "/data/sub-01",
            ResolvedFiles {
                bval: PathBuf::from("/data/sub-01/sub-01_dwi.bval"),
                bvec: PathBuf::from("/data/sub-01/sub-01_dwi.bvec"),
                image: PathBuf::from("/data/sub-01/sub-01_dwi.nii.gz"),
            },
        )
    }

    #[test]
    fn subject_id_from_dir_name() {
        assert_eq!(subject().id, "sub-01");
    }

    #[test]
    fn layout_paths() {
        let s = subject();
        let layout = s.layout();
        assert_eq!(layout.root(), Path::new("/data/sub-01/dti_pipeline"));
        assert_eq!(
            layout.sanitized(&s.files.bval),
            PathBuf::from("/data/sub-01/dti_pipeline/sub-01_dwi_sanitized.bval")
        );
        assert_eq!(
            layout.primary_log(EngineMode::Direct),
            PathBuf::from("/data/sub-01/dti_pipeline/primary_direct.log")
        );
        assert_ne!(layout.sanitized(&s.files.bvec), s.files.bvec);
    }

    #[test]
    fn failed_record_status_line() {
        let record = OutcomeRecord::failed(&subject(), EngineMode::Preprocessing, "panicked");
        assert_eq!(record.method, Method::Fail);
        assert_eq!(record.status_line(), "STATUS sub-01 method=fail value=NA");
    }

    #[test]
    fn method_serializes_lowercase() {
        let json = serde_json::to_string(&Method::Fallback).unwrap();
        assert_eq!(json, "\"fallback\"");
    }
}
