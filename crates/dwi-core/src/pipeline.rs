//! Per-subject pipeline
//!
//! Sanitize, check, acquire the mask, try the primary mode and, if that
//! fails, the fallback. Every path ends in exactly one `OutcomeRecord` and a
//! diagnostic log whose last line is the status line.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tracing::Instrument;

use crate::classify::{EngineOutcome, FailureReason};
use crate::config::PipelineConfig;
use crate::diagnostics::DiagnosticLog;
use crate::engine::ExternalEngine;
use crate::error::PipelineError;
use crate::extract::ResultExtractor;
use crate::fallback::{FallbackInputs, FallbackStage};
use crate::integrity::IntegrityChecker;
use crate::invoke::{CommandRunner, Invoker, Launcher, Scope};
use crate::mask::MaskProvider;
use crate::primary::{PrimaryInputs, PrimaryStage};
use crate::sanitize::Sanitizer;
use crate::state::{StateTracker, SubjectState};
use crate::tools::{FslTools, ImageTools};
use crate::types::{Method, OutcomeRecord, Subject, SubjectLayout};

/// Runs one subject to completion
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubjectRunner: Send + Sync {
    /// Always yields a record, `fail` included
    async fn run(&self, subject: &Subject) -> OutcomeRecord;
}

/// The real per-subject pipeline
#[derive(Clone)]
pub struct SubjectPipeline {
    config: Arc<PipelineConfig>,
    tools: Arc<dyn ImageTools>,
    masks: Arc<MaskProvider>,
    integrity: IntegrityChecker,
    primary: PrimaryStage,
    fallback: FallbackStage,
}

impl std::fmt::Debug for SubjectPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectPipeline")
            .field("mode", &self.config.mode)
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

impl SubjectPipeline {
    /// Pipeline launching every external program through `runner`
    #[must_use]
    pub fn new(config: Arc<PipelineConfig>, runner: Arc<dyn CommandRunner>, masks: Arc<MaskProvider>) -> Self {
        let invoker = Invoker::new(Launcher::from_config(&config), runner);
        let tools: Arc<dyn ImageTools> = Arc::new(FslTools::new(invoker.clone()));
        Self::with_tools(config, invoker, tools, masks)
    }

    /// Pipeline with explicit image tools
    #[must_use]
    pub fn with_tools(
        config: Arc<PipelineConfig>,
        invoker: Invoker,
        tools: Arc<dyn ImageTools>,
        masks: Arc<MaskProvider>,
    ) -> Self {
        let engine = ExternalEngine::from_config(invoker, &config);
        let extractor = ResultExtractor::new(&config.result_label);
        let primary = PrimaryStage::new(engine.clone(), extractor.clone(), config.mode);
        let fallback = FallbackStage::new(Arc::clone(&tools), engine, extractor, config.fallback);
        Self {
            integrity: IntegrityChecker::new(config.fallback.b0_threshold),
            config,
            tools,
            masks,
            primary,
            fallback,
        }
    }

    async fn execute(&self, subject: &Subject) -> OutcomeRecord {
        let layout = subject.layout();
        remove_stale_logs(&layout);

        let mut diag = DiagnosticLog::create(&layout, Local::now());
        diag.section(
            "subject",
            [
                format!("id: {}", subject.id),
                format!("dir: {}", subject.dir.display()),
                format!("mode: {}", self.config.mode),
                format!("image: {}", subject.files.image.display()),
                format!("bval: {}", subject.files.bval.display()),
                format!("bvec: {}", subject.files.bvec.display()),
            ],
        );

        let mut run = Run {
            tracker: StateTracker::new(),
            diag,
            record: OutcomeRecord::failed(subject, self.config.mode, "incomplete"),
        };
        run.record.diagnostic_log = run.diag.path().map(Path::to_path_buf);
        run.diag
            .on_abandon(OutcomeRecord::failed(subject, self.config.mode, "panicked"));

        if let Err(e) = self.stages(subject, &layout, &mut run).await {
            tracing::error!(preflight = e.is_preflight(), "{e}");
            run.diag.line(format!("error: {e}"));
            run.advance(SubjectState::Failed);
            run.record.failure = Some(e.reason_code().to_string());
        }
        run.advance(SubjectState::Done);

        let Run { diag, record, .. } = run;
        match record.method {
            Method::Fail => tracing::warn!(method = %record.method, "subject finished"),
            _ => tracing::info!(method = %record.method, value = ?record.value, "subject finished"),
        }
        diag.finish(&record);
        record
    }

    /// Everything after setup; `Err` only for pre-primary failures
    async fn stages(&self, subject: &Subject, layout: &SubjectLayout, run: &mut Run) -> Result<(), PipelineError> {
        let gradients = Sanitizer::new().sanitize(&subject.files, layout)?;
        run.diag.section(
            "sanitize",
            [
                format!("bval: {}", gradients.bval.display()),
                format!("bvec: {} (transposed: {})", gradients.bvec.display(), gradients.transposed),
            ]
            .into_iter()
            .chain(gradients.ignored.iter().map(|i| format!("ignored: {i}"))),
        );

        let scratch = layout.scratch_dir();
        std::fs::create_dir_all(&scratch).map_err(|e| PipelineError::io(&scratch, e))?;
        let scope = Scope::new(&subject.dir, scratch);

        let (report, table) = self
            .integrity
            .run(self.tools.as_ref(), &subject.files.image, &gradients, &scope)
            .await;
        run.diag.section("integrity", report.lines());
        run.advance(SubjectState::IntegrityChecked);

        let mask = self.masks.acquire(&subject.dir, layout).await?;
        run.diag.line(format!(
            "skeleton mask: {} ({})",
            mask.source.path().display(),
            mask.source.kind()
        ));

        let primary = self
            .primary
            .run(
                &PrimaryInputs {
                    image: subject.files.image.clone(),
                    bval: gradients.bval.clone(),
                    bvec: gradients.bvec.clone(),
                    skeleton_mask: mask.path.clone(),
                },
                layout,
                &scope,
            )
            .await;
        run.record.primary_log = primary.log.clone();

        match &primary.outcome {
            EngineOutcome::Failure(FailureReason::DependencyUnavailable(missing)) => {
                run.diag.line(format!("primary skipped, missing: {missing}"));
                run.advance(SubjectState::PrimaryFailed);
            }
            EngineOutcome::Success(value) => {
                run.advance(SubjectState::PrimaryAttempted);
                run.advance(SubjectState::PrimarySucceeded);
                run.record.method = Method::Primary;
                run.record.value = Some(*value);
                run.record.failure = None;
                return Ok(());
            }
            EngineOutcome::Failure(reason) => {
                run.advance(SubjectState::PrimaryAttempted);
                run.diag.line(format!("primary failed: {}", reason.code()));
                run.advance(SubjectState::PrimaryFailed);
            }
        }

        tracing::warn!(mode = %self.config.mode, "primary mode failed, running fallback");
        run.advance(SubjectState::FallbackAttempted);
        let fallback = self
            .fallback
            .run(
                &FallbackInputs {
                    image: subject.files.image.clone(),
                    bval: gradients.bval,
                    bvec: gradients.bvec,
                    skeleton_mask: mask.path,
                    b0_index: table.b0_index(self.config.fallback.b0_threshold),
                },
                layout,
                &scope,
            )
            .await;
        run.record.fallback_log = fallback.log.clone();

        match fallback.outcome {
            EngineOutcome::Success(value) => {
                run.advance(SubjectState::FallbackSucceeded);
                run.record.method = Method::Fallback;
                run.record.value = Some(value);
                run.record.failure = None;
            }
            EngineOutcome::Failure(reason) => {
                run.diag.line(format!("fallback failed: {}", reason.code()));
                run.advance(SubjectState::FallbackFailed);
                run.record.failure = Some(reason.code().to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SubjectRunner for SubjectPipeline {
    async fn run(&self, subject: &Subject) -> OutcomeRecord {
        let span = tracing::info_span!("subject", id = %subject.id);
        self.execute(subject).instrument(span).await
    }
}

/// Mutable per-run bookkeeping
struct Run {
    tracker: StateTracker,
    diag: DiagnosticLog,
    record: OutcomeRecord,
}

impl Run {
    fn advance(&mut self, to: SubjectState) {
        match self.tracker.advance(to) {
            Ok(from) => self.diag.line(format!("state: {from:?} -> {to:?}")),
            Err(e) => {
                tracing::error!("{e}");
                self.diag.line(format!("error: {e}"));
            }
        }
    }
}

/// Drop stage logs left by an earlier run
fn remove_stale_logs(layout: &SubjectLayout) {
    let pattern = format!(
        "{}/primary_*.log",
        glob::Pattern::escape(&layout.root().to_string_lossy())
    );
    let stale = glob::glob(&pattern)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .chain(std::iter::once(layout.fallback_log()));
    for path in stale {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed stale {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("stale log {}: {e}", path.display()),
        }
    }
}
