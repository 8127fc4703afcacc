//! Fallback stage
//!
//! Runs only after the primary stage failed:
//!
//! ```text
//! b0 volume ─▶ P_lo / P_hi ─▶ threshold ─▶ bin, dilate, erode, dilate ─▶ mask
//!                                   (collapsed? rescue: thrp, bin, dilate, erode)
//! mask + image + tables ─▶ tensor fit ─▶ FA/MD ─▶ engine (from-maps)
//! ```
//!
//! Any tool failure ends the stage; the error text lands in the fallback log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::classify::{EngineOutcome, FailureReason};
use crate::config::{EngineMode, FallbackParams};
use crate::engine::{EngineInputs, EngineRequest, ExternalEngine};
use crate::error::PipelineError;
use crate::extract::ResultExtractor;
use crate::invoke::Scope;
use crate::primary::{run_and_record, StageOutcome};
use crate::tools::{ImageTools, MaskOp, TensorFitRequest, TensorMaps};
use crate::types::SubjectLayout;

/// `lower + fraction * (upper - lower)`
#[inline]
#[must_use]
pub fn adaptive_threshold(lower: f64, upper: f64, fraction: f64) -> f64 {
    lower + fraction * (upper - lower)
}

/// Whether a refined mask is too small to trust
#[inline]
#[must_use]
pub fn needs_rescue(voxels: u64, min_voxels: u64) -> bool {
    voxels < min_voxels
}

/// Inputs of a fallback attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackInputs {
    /// 4D image
    pub image: PathBuf,
    /// Sanitized values
    pub bval: PathBuf,
    /// Sanitized directions
    pub bvec: PathBuf,
    /// Active skeleton mask
    pub skeleton_mask: PathBuf,
    /// Volume used as b0 reference
    pub b0_index: usize,
}

/// Brain mask produced by thresholding
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMask {
    /// Mask file
    pub path: PathBuf,
    /// Absolute threshold of the first pass
    pub threshold: f64,
    /// Voxels in the final mask
    pub voxels: u64,
    /// Rescue pass replaced the first one
    pub rescued: bool,
}

/// Mask derivation, tensor fit and the from-maps engine run
#[derive(Clone)]
pub struct FallbackStage {
    tools: Arc<dyn ImageTools>,
    engine: ExternalEngine,
    extractor: ResultExtractor,
    params: FallbackParams,
}

impl std::fmt::Debug for FallbackStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStage")
            .field("engine", &self.engine)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl FallbackStage {
    /// New stage
    #[must_use]
    pub fn new(
        tools: Arc<dyn ImageTools>,
        engine: ExternalEngine,
        extractor: ResultExtractor,
        params: FallbackParams,
    ) -> Self {
        Self {
            tools,
            engine,
            extractor,
            params,
        }
    }

    /// Run the whole sequence
    pub async fn run(&self, inputs: &FallbackInputs, layout: &SubjectLayout, scope: &Scope) -> StageOutcome {
        let log = layout.fallback_log();
        let maps = match self.prepare(inputs, layout, scope).await {
            Ok(maps) => maps,
            Err(e) => {
                tracing::error!("fallback aborted: {e}");
                return record_failure(&log, &e);
            }
        };

        let request = EngineRequest {
            mode: EngineMode::FromMaps,
            inputs: EngineInputs::Maps {
                fa: maps.fa,
                md: maps.md,
            },
            skeleton_mask: inputs.skeleton_mask.clone(),
            scope: scope.clone(),
        };
        run_and_record(&self.engine, &request, &log, &self.extractor).await
    }

    /// Mask and tensor maps
    async fn prepare(
        &self,
        inputs: &FallbackInputs,
        layout: &SubjectLayout,
        scope: &Scope,
    ) -> Result<TensorMaps, PipelineError> {
        let dir = layout.fallback_dir();
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

        let mask = self.derive_mask(&inputs.image, inputs.b0_index, &dir, scope).await?;
        tracing::info!(
            threshold = mask.threshold,
            voxels = mask.voxels,
            rescued = mask.rescued,
            "brain mask derived"
        );

        let fit = TensorFitRequest {
            image: inputs.image.clone(),
            bval: inputs.bval.clone(),
            bvec: inputs.bvec.clone(),
            mask: mask.path,
            output_base: dir.join("dti"),
        };
        self.tools.fit_tensor(&fit, scope).await
    }

    /// Threshold the b0 volume into a brain mask, rescuing a collapsed one
    pub async fn derive_mask(
        &self,
        image: &Path,
        b0_index: usize,
        dir: &Path,
        scope: &Scope,
    ) -> Result<DerivedMask, PipelineError> {
        let p = &self.params;
        let b0 = dir.join("b0.nii.gz");
        let mask = dir.join("brain_mask.nii.gz");

        self.tools.extract_volume(image, b0_index, &b0, scope).await?;
        let (lower, upper) = self
            .tools
            .percentiles(&b0, p.lower_percentile, p.upper_percentile, scope)
            .await?;
        let threshold = adaptive_threshold(lower, upper, p.threshold_fraction);

        let refine = [
            MaskOp::Threshold(threshold),
            MaskOp::Binarize,
            MaskOp::Dilate,
            MaskOp::Erode,
            MaskOp::Dilate,
        ];
        self.tools.apply(&b0, &refine, &mask, scope).await?;
        let mut voxels = self.tools.voxel_count(&mask, scope).await?;

        let rescued = needs_rescue(voxels, p.min_mask_voxels);
        if rescued {
            tracing::warn!(voxels, min = p.min_mask_voxels, "mask collapsed, recomputing from percentile");
            let rescue = [
                MaskOp::ThresholdPercentile(p.rescue_percentile),
                MaskOp::Binarize,
                MaskOp::Dilate,
                MaskOp::Erode,
            ];
            self.tools.apply(&b0, &rescue, &mask, scope).await?;
            voxels = self.tools.voxel_count(&mask, scope).await?;
        }

        Ok(DerivedMask {
            path: mask,
            threshold,
            voxels,
            rescued,
        })
    }
}

/// Persist a tool failure to the fallback log
fn record_failure(log: &Path, error: &PipelineError) -> StageOutcome {
    let log = match std::fs::write(log, format!("{error}\n")) {
        Ok(()) => Some(log.to_path_buf()),
        Err(e) => {
            tracing::warn!("fallback log {}: {e}", log.display());
            None
        }
    };
    StageOutcome {
        outcome: EngineOutcome::Failure(FailureReason::Computation(error.to_string())),
        log,
    }
}
