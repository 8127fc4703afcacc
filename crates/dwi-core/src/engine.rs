//! External computation engine
//!
//! Builds engine command lines for the three modes and runs them, plus the
//! dependency precheck, through the shared `Invoker`.

use std::path::{Path, PathBuf};

use crate::config::{EngineMode, PipelineConfig};
use crate::error::PipelineError;
use crate::invoke::{path_arg, InvocationOutput, Invoker, Scope};

/// Image-based or map-based engine inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInputs {
    /// Raw series with its (sanitized) gradient tables
    Image {
        /// 4D image
        image: PathBuf,
        /// Gradient values
        bval: PathBuf,
        /// Gradient directions
        bvec: PathBuf,
    },
    /// Precomputed tensor maps
    Maps {
        /// Fractional anisotropy
        fa: PathBuf,
        /// Mean diffusivity
        md: PathBuf,
    },
}

/// One engine request; transient, never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    /// Mode flag
    pub mode: EngineMode,
    /// Inputs matching the mode
    pub inputs: EngineInputs,
    /// Skeleton mask
    pub skeleton_mask: PathBuf,
    /// Mount and scratch directory
    pub scope: Scope,
}

impl EngineRequest {
    /// Engine arguments, without the program
    pub fn arguments(&self, verbose: bool) -> Result<Vec<String>, PipelineError> {
        let mut args = Vec::new();
        match (&self.mode, &self.inputs) {
            (EngineMode::Direct | EngineMode::Preprocessing, EngineInputs::Image { image, bval, bvec }) => {
                let flag = if self.mode == EngineMode::Direct { "-d" } else { "-p" };
                args.extend([
                    flag.to_string(),
                    path_arg(image),
                    "-b".to_string(),
                    path_arg(bval),
                    "-r".to_string(),
                    path_arg(bvec),
                ]);
            }
            (EngineMode::FromMaps, EngineInputs::Maps { fa, md }) => {
                args.extend([
                    "-f".to_string(),
                    path_arg(fa),
                    "-m".to_string(),
                    path_arg(md),
                ]);
            }
            (mode, _) => {
                return Err(PipelineError::EngineInvocationFailure(format!(
                    "inputs do not match mode {mode}"
                )))
            }
        }
        args.extend([
            "-s".to_string(),
            path_arg(&self.skeleton_mask),
            "-t".to_string(),
            path_arg(&self.scope.work_dir),
        ]);
        if verbose {
            args.push("-v".to_string());
        }
        Ok(args)
    }
}

/// Dependency precheck verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precheck {
    /// Every dependency resolved
    pub available: bool,
    /// What was checked
    pub checked: Vec<String>,
    /// Captured shell output or launch error
    pub text: String,
}

impl Precheck {
    /// Text written to the precheck file
    #[must_use]
    pub fn report(&self) -> String {
        format!(
            "checked: {}\navailable: {}\n---\n{}",
            self.checked.join(" "),
            self.available,
            self.text
        )
    }
}

/// The engine behind the invocation abstraction
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    invoker: Invoker,
    entrypoint: String,
    verbose: bool,
}

impl ExternalEngine {
    /// New engine
    #[must_use]
    pub fn new(invoker: Invoker, entrypoint: impl Into<String>, verbose: bool) -> Self {
        Self {
            invoker,
            entrypoint: entrypoint.into(),
            verbose,
        }
    }

    /// From configuration
    #[must_use]
    pub fn from_config(invoker: Invoker, config: &PipelineConfig) -> Self {
        Self::new(invoker, config.entrypoint.clone(), config.verbose_engine)
    }

    /// Run the engine and capture its output
    ///
    /// # Errors
    /// `EngineInvocationFailure` when the request is malformed or the
    /// process could not be started. A non-zero exit is not an error here;
    /// classification happens on the captured text.
    pub async fn invoke(&self, request: &EngineRequest) -> Result<InvocationOutput, PipelineError> {
        let args = request.arguments(self.verbose)?;
        tracing::info!(mode = %request.mode, "invoking engine");
        self.invoker
            .invoke(&self.entrypoint, &args, &request.scope)
            .await
            .map_err(|e| PipelineError::EngineInvocationFailure(format!("{}: {e}", self.entrypoint)))
    }

    /// Check that the entrypoint and the mode's dependencies exist inside
    /// the engine environment; a launch failure counts as unavailable
    pub async fn precheck(&self, mode: EngineMode, scope: &Scope) -> Precheck {
        let checked: Vec<String> = std::iter::once(self.entrypoint.clone())
            .chain(mode.dependencies().iter().map(|d| (*d).to_string()))
            .collect();
        let script = checked
            .iter()
            .map(|d| format!("command -v {d}"))
            .collect::<Vec<_>>()
            .join(" && ");

        match self
            .invoker
            .invoke("sh", &["-c".to_string(), script], scope)
            .await
        {
            Ok(out) => Precheck {
                available: out.success(),
                checked,
                text: out.text,
            },
            Err(e) => Precheck {
                available: false,
                checked,
                text: format!("launch failed: {e}"),
            },
        }
    }
}

/// Missing names from a precheck, for the error message
#[must_use]
pub fn missing_dependencies(precheck: &Precheck) -> Vec<String> {
    precheck
        .checked
        .iter()
        .filter(|d| {
            !precheck
                .text
                .lines()
                .any(|l| Path::new(l.trim()).file_name().is_some_and(|n| n == d.as_str()))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerRuntime;
    use crate::invoke::{Launcher, MockCommandRunner};
    use std::sync::Arc;

    fn scope() -> Scope {
        Scope::new("/d/s", "/d/s/dti_pipeline/scratch")
    }

    fn image_request(mode: EngineMode) -> EngineRequest {
        EngineRequest {
            mode,
            inputs: EngineInputs::Image {
                image: "/d/s/dwi.nii.gz".into(),
                bval: "/d/s/dti_pipeline/dwi_sanitized.bval".into(),
                bvec: "/d/s/dti_pipeline/dwi_sanitized.bvec".into(),
            },
            skeleton_mask: "/d/s/dti_pipeline/skeleton_mask.nii.gz".into(),
            scope: scope(),
        }
    }

    #[test]
    fn preprocessing_arguments() {
        let args = image_request(EngineMode::Preprocessing).arguments(true).unwrap();
        assert_eq!(
            args.join(" "),
            "-p /d/s/dwi.nii.gz -b /d/s/dti_pipeline/dwi_sanitized.bval \
             -r /d/s/dti_pipeline/dwi_sanitized.bvec -s /d/s/dti_pipeline/skeleton_mask.nii.gz \
             -t /d/s/dti_pipeline/scratch -v"
        );
    }

    #[test]
    fn direct_uses_d_flag() {
        let args = image_request(EngineMode::Direct).arguments(false).unwrap();
        assert_eq!(args[0], "-d");
        assert!(!args.contains(&"-v".to_string()));
    }

    #[test]
    fn from_maps_arguments() {
        let request = EngineRequest {
            mode: EngineMode::FromMaps,
            inputs: EngineInputs::Maps {
                fa: "/d/s/fa.nii.gz".into(),
                md: "/d/s/md.nii.gz".into(),
            },
            skeleton_mask: "/d/s/mask.nii.gz".into(),
            scope: scope(),
        };
        let args = request.arguments(false).unwrap();
        assert_eq!(&args[..4], &["-f", "/d/s/fa.nii.gz", "-m", "/d/s/md.nii.gz"]);
    }

    #[test]
    fn mismatched_inputs_rejected() {
        let request = image_request(EngineMode::FromMaps);
        assert!(matches!(
            request.arguments(false),
            Err(PipelineError::EngineInvocationFailure(_))
        ));
    }

    #[tokio::test]
    async fn precheck_reports_unavailable_on_nonzero_exit() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.program == "sh" && inv.args[1] == "command -v psmd.sh && command -v eddy")
            .returning(|_| Ok(InvocationOutput::failed(1, "/usr/bin/psmd.sh\n")));
        let engine = ExternalEngine::new(
            Invoker::new(Launcher::new(ContainerRuntime::Native, "", 1), Arc::new(runner)),
            "psmd.sh",
            true,
        );

        let precheck = engine.precheck(EngineMode::Preprocessing, &scope()).await;
        assert!(!precheck.available);
        assert_eq!(missing_dependencies(&precheck), vec!["eddy".to_string()]);
    }

    #[tokio::test]
    async fn launch_failure_is_invocation_failure() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "docker not found"))
        });
        let engine = ExternalEngine::new(
            Invoker::new(Launcher::new(ContainerRuntime::Docker, "img", 1), Arc::new(runner)),
            "psmd.sh",
            true,
        );

        let err = engine.invoke(&image_request(EngineMode::Direct)).await.unwrap_err();
        assert!(matches!(err, PipelineError::EngineInvocationFailure(_)));
    }
}
