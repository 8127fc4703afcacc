//! File resolution
//!
//! Locates a subject's gradient-value, gradient-direction and image files
//! with a priority-ordered pattern search. Candidates that still carry a
//! gradient-table suffix are metadata, not images, and are rejected.

use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::error::PipelineError;
use crate::types::ResolvedFiles;

const VALUE_SUFFIX: &str = ".bval";
const DIRECTION_SUFFIX: &str = ".bvec";
const IMAGE_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Diffusion-tagged patterns come first
const VALUE_PATTERNS: [&str; 2] = ["*dwi*.bval", "*.bval"];
const IMAGE_PATTERNS: [&str; 4] = ["*dwi*.nii.gz", "*dwi*.nii", "*.nii.gz", "*.nii"];

/// Stateless resolver for subject directories
#[derive(Debug, Clone, Copy, Default)]
pub struct FileResolver;

impl FileResolver {
    /// Create resolver
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolve the (bval, bvec, image) triplet of `dir`
    ///
    /// # Errors
    /// - `MissingFile` when no value file or no matching direction file exists
    /// - `NiftiNotFound` when no image candidate survives the metadata guard
    pub fn resolve(&self, dir: &Path) -> Result<ResolvedFiles, PipelineError> {
        let bval = VALUE_PATTERNS
            .iter()
            .find_map(|pattern| first_match(dir, pattern))
            .ok_or_else(|| PipelineError::MissingFile {
                what: "gradient values (.bval)",
                dir: dir.to_path_buf(),
            })?;

        let bvec = direction_path(&bval);
        if !bvec.is_file() {
            return Err(PipelineError::MissingFile {
                what: "gradient directions (.bvec)",
                dir: dir.to_path_buf(),
            });
        }

        let image = sibling_images(&bval)
            .into_iter()
            .find(|p| p.is_file() && !is_metadata_like(p))
            .or_else(|| {
                IMAGE_PATTERNS
                    .iter()
                    .flat_map(|pattern| matches(dir, pattern))
                    .find(|p| !is_metadata_like(p))
            })
            .ok_or_else(|| PipelineError::NiftiNotFound(dir.to_path_buf()))?;

        Ok(ResolvedFiles { bval, bvec, image })
    }

    /// Whether `dir` holds a resolvable subject
    #[inline]
    #[must_use]
    pub fn is_valid_subject(&self, dir: &Path) -> bool {
        dir.is_dir() && self.resolve(dir).is_ok()
    }
}

/// `x.bval` -> `x.bvec`
fn direction_path(bval: &Path) -> PathBuf {
    let name = file_name(bval);
    let stem = name.strip_suffix(VALUE_SUFFIX).unwrap_or(&name);
    bval.with_file_name(format!("{stem}{DIRECTION_SUFFIX}"))
}

/// Images named after the value file, compressed first
fn sibling_images(bval: &Path) -> Vec<PathBuf> {
    let name = file_name(bval);
    let stem = name.strip_suffix(VALUE_SUFFIX).unwrap_or(&name);
    let mut stems = vec![stem.to_string()];
    let trimmed = stem.trim_end_matches(['_', '.', '-']);
    if trimmed != stem && !trimmed.is_empty() {
        stems.push(trimmed.to_string());
    }

    stems
        .iter()
        .flat_map(|s| IMAGE_EXTENSIONS.iter().map(move |ext| bval.with_file_name(format!("{s}{ext}"))))
        .collect()
}

/// Names like `x.bval.nii.gz` or skeleton masks are not diffusion images
fn is_metadata_like(path: &Path) -> bool {
    let name = file_name(path).to_ascii_lowercase();
    let base = IMAGE_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(&name);
    base.contains(VALUE_SUFFIX)
        || base.contains(DIRECTION_SUFFIX)
        || base.ends_with("bval")
        || base.ends_with("bvec")
        || base.contains("skeleton")
}

fn first_match(dir: &Path, pattern: &str) -> Option<PathBuf> {
    matches(dir, pattern).into_iter().next()
}

/// Regular files matching `pattern` directly under `dir`, sorted
fn matches(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut found: Vec<PathBuf> = match glob::glob(&full) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!("invalid search pattern {}: {}", full, e);
            Vec::new()
        }
    };
    found.sort();
    found
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
