//! DWI Core - per-subject diffusion pipeline orchestration
//!
//! Drives an external diffusion-metric engine over one subject directory or
//! a whole batch of them:
//! - Resolves and sanitizes each subject's gradient tables and image
//! - Tries the engine's primary mode, then a mask/tensor-fit fallback
//! - Runs subjects under a bounded worker pool
//! - Folds every outcome into one CSV report
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dwi_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(PipelineConfig::new().with_jobs(2));
//! let root = std::path::Path::new("/data/study");
//!
//! let masks = Arc::new(MaskProvider::new(&config, root));
//! let pipeline = SubjectPipeline::new(Arc::clone(&config), Arc::new(ProcessRunner), masks);
//! let scheduler = BatchScheduler::new(Arc::new(pipeline), &config);
//!
//! let summary = scheduler.run(BatchScheduler::discover(root)?).await;
//! ResultAggregator::default().aggregate(&summary.outcomes, &default_report_path(root))?;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod integrity;
pub mod invoke;
pub mod mask;
pub mod pipeline;
pub mod primary;
pub mod report;
pub mod resolver;
pub mod sanitize;
pub mod scheduler;
pub mod state;
pub mod tools;
pub mod types;

// Re-exports for convenience
pub use classify::{classify, classify_text, EngineOutcome, FailureReason, FAILURE_MARKERS};
pub use config::{ContainerRuntime, EngineMode, FallbackParams, PipelineConfig};
pub use diagnostics::DiagnosticLog;
pub use engine::{EngineInputs, EngineRequest, ExternalEngine, Precheck};
pub use error::{BatchError, IntegrityMismatch, PipelineError};
pub use extract::ResultExtractor;
pub use fallback::{adaptive_threshold, needs_rescue, FallbackInputs, FallbackStage};
pub use integrity::{IntegrityChecker, IntegrityReport};
pub use invoke::{CommandRunner, Invocation, InvocationOutput, Invoker, Launcher, ProcessRunner, Scope};
pub use mask::{ActiveMask, MaskProvider, MaskSource};
pub use pipeline::{SubjectPipeline, SubjectRunner};
pub use primary::{PrimaryInputs, PrimaryStage, StageOutcome};
pub use report::{classify_method, default_report_path, ReportRow, ResultAggregator};
pub use resolver::FileResolver;
pub use sanitize::{GradientTable, SanitizedGradients, Sanitizer};
pub use scheduler::{BatchScheduler, BatchSummary};
pub use state::{StateTracker, SubjectState};
pub use tools::{FslTools, ImageTools, MaskOp, TensorMaps};
pub use types::{Method, OutcomeRecord, ResolvedFiles, Subject, SubjectLayout};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a run
    pub use crate::{
        default_report_path, BatchError, BatchScheduler, BatchSummary, EngineMode, FileResolver,
        MaskProvider, Method, OutcomeRecord, PipelineConfig, ProcessRunner, ResultAggregator,
        Subject, SubjectPipeline, SubjectRunner,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
