//! External image operations
//!
//! Volume extraction, percentile statistics, thresholding, morphology and
//! tensor fitting are opaque external operations. `ImageTools` is the seam;
//! `FslTools` drives the FSL command set through the shared `Invoker`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::invoke::{path_arg, Invoker, Scope};

/// One `fslmaths` step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskOp {
    /// Zero voxels below an absolute intensity
    Threshold(f64),
    /// Zero voxels below a robust-range percentile
    ThresholdPercentile(f64),
    /// Binarize
    Binarize,
    /// Dilate
    Dilate,
    /// Erode
    Erode,
}

impl MaskOp {
    fn args(self) -> Vec<String> {
        match self {
            MaskOp::Threshold(v) => vec!["-thr".to_string(), v.to_string()],
            MaskOp::ThresholdPercentile(p) => vec!["-thrp".to_string(), p.to_string()],
            MaskOp::Binarize => vec!["-bin".to_string()],
            MaskOp::Dilate => vec!["-dilM".to_string()],
            MaskOp::Erode => vec!["-ero".to_string()],
        }
    }
}

/// FA and MD maps written by tensor fitting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMaps {
    /// Fractional anisotropy
    pub fa: PathBuf,
    /// Mean diffusivity
    pub md: PathBuf,
}

/// Inputs of a tensor fit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorFitRequest {
    /// 4D image
    pub image: PathBuf,
    /// Sanitized values
    pub bval: PathBuf,
    /// Sanitized directions
    pub bvec: PathBuf,
    /// Brain mask
    pub mask: PathBuf,
    /// Output basename
    pub output_base: PathBuf,
}

/// Image operations used by the integrity check and the fallback stage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageTools: Send + Sync {
    /// Fourth dimension of `image`
    async fn volume_count(&self, image: &Path, scope: &Scope) -> Result<usize, PipelineError>;

    /// Copy volume `index` of `image` to `output`
    async fn extract_volume(
        &self,
        image: &Path,
        index: usize,
        output: &Path,
        scope: &Scope,
    ) -> Result<(), PipelineError>;

    /// Intensity percentiles `(lower, upper)` of `image`
    async fn percentiles(
        &self,
        image: &Path,
        lower: f64,
        upper: f64,
        scope: &Scope,
    ) -> Result<(f64, f64), PipelineError>;

    /// Apply `ops` in order to `input`, writing `output`
    async fn apply(
        &self,
        input: &Path,
        ops: &[MaskOp],
        output: &Path,
        scope: &Scope,
    ) -> Result<(), PipelineError>;

    /// Number of non-zero voxels
    async fn voxel_count(&self, mask: &Path, scope: &Scope) -> Result<u64, PipelineError>;

    /// Fit tensors and return the derived maps
    async fn fit_tensor(
        &self,
        request: &TensorFitRequest,
        scope: &Scope,
    ) -> Result<TensorMaps, PipelineError>;
}

/// FSL-backed image tools
#[derive(Debug, Clone)]
pub struct FslTools {
    invoker: Invoker,
}

impl FslTools {
    /// New tool set
    #[must_use]
    pub fn new(invoker: Invoker) -> Self {
        Self { invoker }
    }

    /// Run `tool`; non-zero exit or launch failure is a computation failure
    async fn run(&self, tool: &'static str, args: Vec<String>, scope: &Scope) -> Result<String, PipelineError> {
        let out = self
            .invoker
            .invoke(tool, &args, scope)
            .await
            .map_err(|e| PipelineError::fallback(tool, format!("launch failed: {e}")))?;
        if !out.success() {
            return Err(PipelineError::fallback(
                tool,
                format!("exit {:?}: {}", out.exit_code, out.text.trim()),
            ));
        }
        Ok(out.text)
    }
}

#[async_trait]
impl ImageTools for FslTools {
    async fn volume_count(&self, image: &Path, scope: &Scope) -> Result<usize, PipelineError> {
        let text = self
            .run("fslval", vec![path_arg(image), "dim4".to_string()], scope)
            .await?;
        parse_numbers(&text)
            .first()
            .map(|v| *v as usize)
            .ok_or_else(|| PipelineError::fallback("fslval", format!("unparsable output: {}", text.trim())))
    }

    async fn extract_volume(
        &self,
        image: &Path,
        index: usize,
        output: &Path,
        scope: &Scope,
    ) -> Result<(), PipelineError> {
        let args = vec![path_arg(image), path_arg(output), index.to_string(), "1".to_string()];
        self.run("fslroi", args, scope).await.map(|_| ())
    }

    async fn percentiles(
        &self,
        image: &Path,
        lower: f64,
        upper: f64,
        scope: &Scope,
    ) -> Result<(f64, f64), PipelineError> {
        let args = vec![
            path_arg(image),
            "-P".to_string(),
            lower.to_string(),
            "-P".to_string(),
            upper.to_string(),
        ];
        let text = self.run("fslstats", args, scope).await?;
        match parse_numbers(&text).as_slice() {
            [lo, hi, ..] => Ok((*lo, *hi)),
            _ => Err(PipelineError::fallback(
                "fslstats",
                format!("expected two percentiles, got: {}", text.trim()),
            )),
        }
    }

    async fn apply(
        &self,
        input: &Path,
        ops: &[MaskOp],
        output: &Path,
        scope: &Scope,
    ) -> Result<(), PipelineError> {
        let mut args = vec![path_arg(input)];
        args.extend(ops.iter().flat_map(|op| op.args()));
        args.push(path_arg(output));
        self.run("fslmaths", args, scope).await.map(|_| ())
    }

    async fn voxel_count(&self, mask: &Path, scope: &Scope) -> Result<u64, PipelineError> {
        let text = self
            .run("fslstats", vec![path_arg(mask), "-V".to_string()], scope)
            .await?;
        parse_numbers(&text)
            .first()
            .map(|v| *v as u64)
            .ok_or_else(|| PipelineError::fallback("fslstats", format!("unparsable voxel count: {}", text.trim())))
    }

    async fn fit_tensor(
        &self,
        request: &TensorFitRequest,
        scope: &Scope,
    ) -> Result<TensorMaps, PipelineError> {
        let args = vec![
            "-k".to_string(),
            path_arg(&request.image),
            "-o".to_string(),
            path_arg(&request.output_base),
            "-m".to_string(),
            path_arg(&request.mask),
            "-r".to_string(),
            path_arg(&request.bvec),
            "-b".to_string(),
            path_arg(&request.bval),
        ];
        self.run("dtifit", args, scope).await?;
        Ok(tensor_maps(&request.output_base))
    }
}

/// `<base>_FA.nii.gz` / `<base>_MD.nii.gz`
#[must_use]
pub fn tensor_maps(base: &Path) -> TensorMaps {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    TensorMaps {
        fa: base.with_file_name(format!("{name}_FA.nii.gz")),
        md: base.with_file_name(format!("{name}_MD.nii.gz")),
    }
}

/// Every whitespace token that parses as a finite number
fn parse_numbers(text: &str) -> Vec<f64> {
    text.split_whitespace()
        .filter_map(|t| t.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect()
}
