//! Skeleton mask acquisition
//!
//! Exactly one mask is active per subject. Sources, first hit wins:
//! 1. explicit override (must exist)
//! 2. `skeleton_mask*.nii*` inside the subject directory
//! 3. shared default `<root>/skeleton_mask.nii.gz`
//! 4. remote download into the shared default, attempted once per run
//!
//! The chosen file is copied into the subject's output directory; sources are
//! never modified.

use std::io::Write;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tokio::sync::OnceCell;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::types::SubjectLayout;

/// File name of the shared default mask
pub const SHARED_MASK_NAME: &str = "skeleton_mask.nii.gz";

/// Where the active mask came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskSource {
    /// Supplied on the command line
    Override(PathBuf),
    /// Found in the subject directory
    Subject(PathBuf),
    /// Shared default under the root
    Shared(PathBuf),
    /// Downloaded this run
    Remote(PathBuf),
}

impl MaskSource {
    /// Source file
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            MaskSource::Override(p)
            | MaskSource::Subject(p)
            | MaskSource::Shared(p)
            | MaskSource::Remote(p) => p,
        }
    }

    /// Short tag for the diagnostic log
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MaskSource::Override(_) => "override",
            MaskSource::Subject(_) => "subject",
            MaskSource::Shared(_) => "shared",
            MaskSource::Remote(_) => "remote",
        }
    }
}

/// Active mask of one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMask {
    /// Copy inside the subject's output directory
    pub path: PathBuf,
    /// Origin
    pub source: MaskSource,
}

/// Resolves skeleton masks; shared by every subject of a run
#[derive(Debug)]
pub struct MaskProvider {
    override_path: Option<PathBuf>,
    shared_default: PathBuf,
    url: String,
    remote: OnceCell<Result<PathBuf, String>>,
}

impl MaskProvider {
    /// Provider whose shared default lives in `shared_root`
    #[must_use]
    pub fn new(config: &PipelineConfig, shared_root: &Path) -> Self {
        Self {
            override_path: config.mask_override.clone(),
            shared_default: shared_root.join(SHARED_MASK_NAME),
            url: config.mask_url.clone(),
            remote: OnceCell::new(),
        }
    }

    /// Shared default location
    #[inline]
    #[must_use]
    pub fn shared_default(&self) -> &Path {
        &self.shared_default
    }

    /// Pick a source for `subject_dir` without copying
    pub async fn locate(&self, subject_dir: &Path) -> Result<MaskSource, PipelineError> {
        if let Some(path) = &self.override_path {
            return if path.is_file() {
                Ok(MaskSource::Override(path.clone()))
            } else {
                Err(PipelineError::MaskAcquisitionFailure(format!(
                    "override {} does not exist",
                    path.display()
                )))
            };
        }
        if let Some(path) = subject_mask(subject_dir) {
            return Ok(MaskSource::Subject(path));
        }
        if self.shared_default.is_file() {
            return Ok(MaskSource::Shared(self.shared_default.clone()));
        }
        self.fetch_once().await.map(MaskSource::Remote)
    }

    /// Locate a mask and copy it into the subject's output directory
    pub async fn acquire(&self, subject_dir: &Path, layout: &SubjectLayout) -> Result<ActiveMask, PipelineError> {
        let source = self.locate(subject_dir).await?;
        let dest = layout.skeleton_mask();
        if source.path() != dest {
            std::fs::create_dir_all(layout.root()).map_err(|e| PipelineError::io(layout.root(), e))?;
            std::fs::copy(source.path(), &dest).map_err(|e| {
                PipelineError::MaskAcquisitionFailure(format!(
                    "copy {} -> {}: {e}",
                    source.path().display(),
                    dest.display()
                ))
            })?;
        }
        tracing::info!(source = source.kind(), "skeleton mask {}", source.path().display());
        Ok(ActiveMask { path: dest, source })
    }

    /// Download the default mask once; the outcome, success or not, is shared
    async fn fetch_once(&self) -> Result<PathBuf, PipelineError> {
        self.remote
            .get_or_init(|| async {
                download(&self.url, &self.shared_default)
                    .await
                    .map(|()| self.shared_default.clone())
            })
            .await
            .clone()
            .map_err(PipelineError::MaskAcquisitionFailure)
    }
}

/// First `skeleton_mask*.nii*` in the subject directory
fn subject_mask(dir: &Path) -> Option<PathBuf> {
    let pattern = format!(
        "{}/skeleton_mask*.nii*",
        Pattern::escape(&dir.to_string_lossy())
    );
    let mut hits: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    hits.sort();
    hits.into_iter().next()
}

/// GET `url` into `dest` through a temp file in the same directory
async fn download(url: &str, dest: &Path) -> Result<(), String> {
    if url.trim().is_empty() {
        return Err("no shared mask and no remote location configured".to_string());
    }
    tracing::info!(url, "fetching default skeleton mask");

    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| format!("GET {url}: {e}"))?;
    let bytes = response.bytes().await.map_err(|e| format!("GET {url}: {e}"))?;
    if bytes.is_empty() {
        return Err(format!("GET {url}: empty body"));
    }

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| format!("temp file in {}: {e}", parent.display()))?;
    tmp.write_all(&bytes)
        .map_err(|e| format!("write {}: {e}", tmp.path().display()))?;
    tmp.persist(dest)
        .map_err(|e| format!("persist {}: {}", dest.display(), e.error))?;
    Ok(())
}
