//! Primary stage: the engine in direct or preprocessing mode
//!
//! The dependency precheck runs first and is written to the precheck file.
//! A missing dependency skips the engine entirely; the stage then fails the
//! same way an engine failure would.

use std::path::{Path, PathBuf};

use crate::classify::{classify, EngineOutcome, FailureReason};
use crate::config::EngineMode;
use crate::engine::{missing_dependencies, EngineInputs, EngineRequest, ExternalEngine};
use crate::extract::ResultExtractor;
use crate::invoke::Scope;
use crate::types::SubjectLayout;

/// Outcome of one stage plus the log it left behind
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// Classified engine outcome
    pub outcome: EngineOutcome,
    /// Stage log, when the engine ran
    pub log: Option<PathBuf>,
}

impl StageOutcome {
    pub(crate) fn skipped(reason: FailureReason) -> Self {
        Self {
            outcome: EngineOutcome::Failure(reason),
            log: None,
        }
    }
}

/// Inputs of a primary attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInputs {
    /// 4D image
    pub image: PathBuf,
    /// Sanitized values
    pub bval: PathBuf,
    /// Sanitized directions
    pub bvec: PathBuf,
    /// Active skeleton mask
    pub skeleton_mask: PathBuf,
}

/// Engine in the configured primary mode
#[derive(Debug, Clone)]
pub struct PrimaryStage {
    engine: ExternalEngine,
    extractor: ResultExtractor,
    mode: EngineMode,
}

impl PrimaryStage {
    /// New stage
    #[must_use]
    pub fn new(engine: ExternalEngine, extractor: ResultExtractor, mode: EngineMode) -> Self {
        Self {
            engine,
            extractor,
            mode,
        }
    }

    /// Configured mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Precheck, then invoke and classify
    pub async fn run(&self, inputs: &PrimaryInputs, layout: &SubjectLayout, scope: &Scope) -> StageOutcome {
        let precheck = self.engine.precheck(self.mode, scope).await;
        let precheck_file = layout.precheck_file();
        if let Err(e) = std::fs::write(&precheck_file, precheck.report()) {
            tracing::warn!("precheck file {}: {e}", precheck_file.display());
        }
        if !precheck.available {
            let missing = missing_dependencies(&precheck).join(" ");
            tracing::warn!(mode = %self.mode, missing, "dependency unavailable, skipping primary mode");
            return StageOutcome::skipped(FailureReason::DependencyUnavailable(missing));
        }

        let request = EngineRequest {
            mode: self.mode,
            inputs: EngineInputs::Image {
                image: inputs.image.clone(),
                bval: inputs.bval.clone(),
                bvec: inputs.bvec.clone(),
            },
            skeleton_mask: inputs.skeleton_mask.clone(),
            scope: scope.clone(),
        };
        let log = layout.primary_log(self.mode);
        run_and_record(&self.engine, &request, &log, &self.extractor).await
    }
}

/// Invoke the engine, persist the captured text to `log`, classify
///
/// A launch failure is logged as text and classified as `Launch`; a log that
/// cannot be written fails the stage.
pub(crate) async fn run_and_record(
    engine: &ExternalEngine,
    request: &EngineRequest,
    log: &Path,
    extractor: &ResultExtractor,
) -> StageOutcome {
    let (text, exit_code, launch_error) = match engine.invoke(request).await {
        Ok(out) => (out.text, out.exit_code, None),
        Err(e) => (format!("{e}\n"), None, Some(e.to_string())),
    };

    if let Err(e) = std::fs::write(log, &text) {
        tracing::error!("stage log {}: {e}", log.display());
        return StageOutcome::skipped(FailureReason::Io(format!("{}: {e}", log.display())));
    }

    let outcome = match launch_error {
        Some(message) => EngineOutcome::Failure(FailureReason::Launch(message)),
        None => classify(exit_code, &text, extractor),
    };
    StageOutcome {
        outcome,
        log: Some(log.to_path_buf()),
    }
}
