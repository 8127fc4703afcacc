//! Run configuration
//!
//! One immutable value, built once at startup and shared as
//! `Arc<PipelineConfig>` by every component.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Default engine container image
pub const DEFAULT_ENGINE_IMAGE: &str = "ghcr.io/miac-research/psmd:latest";

/// Default engine program inside the image
pub const DEFAULT_ENTRYPOINT: &str = "psmd.sh";

/// Default remote skeleton mask
pub const DEFAULT_MASK_URL: &str =
    "https://raw.githubusercontent.com/miac-research/psmd/main/skeleton_mask_2019.nii.gz";

/// Engine invocation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineMode {
    /// Data already preprocessed; engine fits and skeletonizes directly
    Direct,
    /// Engine runs its own preprocessing first
    Preprocessing,
    /// Metric from precomputed FA/MD maps (fallback only)
    FromMaps,
}

impl EngineMode {
    /// Lowercase name as used in file names and reports
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EngineMode::Direct => "direct",
            EngineMode::Preprocessing => "preprocessing",
            EngineMode::FromMaps => "from-maps",
        }
    }

    /// Tools the engine environment must provide for this mode,
    /// besides the entrypoint itself
    #[must_use]
    pub fn dependencies(self) -> &'static [&'static str] {
        match self {
            EngineMode::Preprocessing => &["eddy"],
            EngineMode::Direct | EngineMode::FromMaps => &[],
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineMode {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(EngineMode::Direct),
            "preprocessing" => Ok(EngineMode::Preprocessing),
            "from-maps" => Ok(EngineMode::FromMaps),
            other => Err(BatchError::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// How external programs are launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// `docker run`
    Docker,
    /// `apptainer exec`
    Apptainer,
    /// Programs on the host `PATH`
    Native,
}

impl FromStr for ContainerRuntime {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(ContainerRuntime::Docker),
            "apptainer" | "singularity" => Ok(ContainerRuntime::Apptainer),
            "native" | "none" => Ok(ContainerRuntime::Native),
            other => Err(BatchError::Config(format!("unknown runtime: {other}"))),
        }
    }
}

/// Fallback mask heuristics
///
/// Fixed constants in the source workflow with no stated derivation, kept
/// configurable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackParams {
    /// Gradient values below this count as b0
    pub b0_threshold: f64,
    /// Lower intensity percentile
    pub lower_percentile: f64,
    /// Upper intensity percentile
    pub upper_percentile: f64,
    /// Fraction of the percentile range added to the lower percentile
    pub threshold_fraction: f64,
    /// Masks smaller than this are treated as collapsed
    pub min_mask_voxels: u64,
    /// Percentile threshold used when the mask collapsed
    pub rescue_percentile: f64,
}

impl Default for FallbackParams {
    fn default() -> Self {
        Self {
            b0_threshold: 50.0,
            lower_percentile: 2.0,
            upper_percentile: 98.0,
            threshold_fraction: 0.20,
            min_mask_voxels: 1000,
            rescue_percentile: 10.0,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Primary engine mode (direct or preprocessing)
    pub mode: EngineMode,
    /// Engine container image
    pub engine_image: String,
    /// Engine program inside the image
    pub entrypoint: String,
    /// Container runtime
    pub runtime: ContainerRuntime,
    /// Numeric thread hint passed to every external program
    pub thread_hint: usize,
    /// Maximum concurrently running subjects
    pub jobs: usize,
    /// Skeleton mask override
    pub mask_override: Option<PathBuf>,
    /// Remote default mask location
    pub mask_url: String,
    /// Word preceding `is <number>` in engine output
    pub result_label: String,
    /// Aggregate report path; defaults to `<root>/batch_results.csv`
    pub report_path: Option<PathBuf>,
    /// Pass verbosity flag to the engine
    pub verbose_engine: bool,
    /// Fallback heuristics
    pub fallback: FallbackParams,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With primary mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    /// With container runtime
    #[inline]
    #[must_use]
    pub fn with_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.runtime = runtime;
        self
    }

    /// With max concurrent subjects, clamped to at least one
    #[inline]
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// With thread hint, clamped to at least one
    #[inline]
    #[must_use]
    pub fn with_thread_hint(mut self, threads: usize) -> Self {
        self.thread_hint = threads.max(1);
        self
    }

    /// With mask override
    #[inline]
    #[must_use]
    pub fn with_mask_override(mut self, mask: Option<PathBuf>) -> Self {
        self.mask_override = mask;
        self
    }

    /// With result label
    #[inline]
    #[must_use]
    pub fn with_result_label(mut self, label: impl Into<String>) -> Self {
        self.result_label = label.into();
        self
    }

    /// With fallback heuristics
    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, params: FallbackParams) -> Self {
        self.fallback = params;
        self
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.mode == EngineMode::FromMaps {
            return Err(BatchError::Config(
                "from-maps is reserved for the fallback stage".to_string(),
            ));
        }
        if self.engine_image.trim().is_empty() && self.runtime != ContainerRuntime::Native {
            return Err(BatchError::Config("engine image is empty".to_string()));
        }
        if self.result_label.trim().is_empty() {
            return Err(BatchError::Config("result label is empty".to_string()));
        }
        let p = &self.fallback;
        if !(0.0..=1.0).contains(&p.threshold_fraction) {
            return Err(BatchError::Config(format!(
                "threshold fraction {} outside [0, 1]",
                p.threshold_fraction
            )));
        }
        if p.lower_percentile >= p.upper_percentile
            || p.lower_percentile < 0.0
            || p.upper_percentile > 100.0
        {
            return Err(BatchError::Config(format!(
                "invalid percentile range {}..{}",
                p.lower_percentile, p.upper_percentile
            )));
        }
        if !(0.0..=100.0).contains(&p.rescue_percentile) {
            return Err(BatchError::Config(format!(
                "rescue percentile {} outside [0, 100]",
                p.rescue_percentile
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Preprocessing,
            engine_image: DEFAULT_ENGINE_IMAGE.to_string(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            runtime: ContainerRuntime::Docker,
            thread_hint: 1,
            jobs: 1,
            mask_override: None,
            mask_url: DEFAULT_MASK_URL.to_string(),
            result_label: "result".to_string(),
            report_path: None,
            verbose_engine: true,
            fallback: FallbackParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_source_workflow() {
        let config = PipelineConfig::new();
        assert_eq!(config.mode, EngineMode::Preprocessing);
        assert_eq!(config.jobs, 1);
        assert_eq!(config.thread_hint, 1);
        assert_eq!(config.fallback.min_mask_voxels, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn jobs_clamped_to_one() {
        assert_eq!(PipelineConfig::new().with_jobs(0).jobs, 1);
        assert_eq!(PipelineConfig::new().with_jobs(4).jobs, 4);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Direct".parse::<EngineMode>().unwrap(), EngineMode::Direct);
        assert_eq!(
            " preprocessing ".parse::<EngineMode>().unwrap(),
            EngineMode::Preprocessing
        );
        assert!("fast".parse::<EngineMode>().is_err());
    }

    #[test]
    fn runtime_parsing() {
        assert_eq!("singularity".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Apptainer);
        assert_eq!("native".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Native);
    }

    #[test]
    fn from_maps_rejected_as_primary_mode() {
        let config = PipelineConfig::new().with_mode(EngineMode::FromMaps);
        assert!(matches!(config.validate(), Err(BatchError::Config(_))));
    }

    #[test]
    fn invalid_percentiles_rejected() {
        let params = FallbackParams {
            lower_percentile: 98.0,
            upper_percentile: 2.0,
            ..FallbackParams::default()
        };
        assert!(PipelineConfig::new().with_fallback(params).validate().is_err());

        let params = FallbackParams {
            threshold_fraction: 1.5,
            ..FallbackParams::default()
        };
        assert!(PipelineConfig::new().with_fallback(params).validate().is_err());
    }

    #[test]
    fn preprocessing_requires_eddy() {
        assert_eq!(EngineMode::Preprocessing.dependencies(), &["eddy"]);
        assert!(EngineMode::Direct.dependencies().is_empty());
    }
}
