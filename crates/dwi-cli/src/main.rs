//! `dwi-orchestrate`: run the diffusion pipeline on one subject or a batch
//!
//! Exit codes: 0 when the run completed (whatever the subject outcomes),
//! 2 for an invalid target or configuration, 3 when no subject validated,
//! 1 for anything else.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use dwi_core::config::{DEFAULT_ENGINE_IMAGE, DEFAULT_ENTRYPOINT, DEFAULT_MASK_URL};
use dwi_core::prelude::*;
use dwi_core::ContainerRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Diffusion pipeline orchestrator
#[derive(Debug, Parser)]
#[command(name = "dwi-orchestrate", version, about)]
struct Cli {
    /// Subject directory or batch root
    target: PathBuf,

    /// Skeleton mask overriding every other source
    mask: Option<PathBuf>,

    /// Primary engine mode: direct or preprocessing
    #[arg(long, env = "MODE", default_value = "preprocessing")]
    mode: EngineMode,

    /// Engine container image
    #[arg(long, env = "ENGINE_IMAGE", default_value = DEFAULT_ENGINE_IMAGE)]
    engine_image: String,

    /// Thread hint exported to every external program
    #[arg(long, env = "THREAD_HINT", default_value_t = 1)]
    threads: usize,

    /// Maximum concurrently running subjects
    #[arg(long, env = "JOBS", default_value_t = 1)]
    jobs: usize,

    /// Container runtime: docker, apptainer or native
    #[arg(long, env = "ENGINE_RUNTIME", default_value = "docker")]
    runtime: ContainerRuntime,

    /// Engine program inside the image
    #[arg(long, env = "ENGINE_ENTRYPOINT", default_value = DEFAULT_ENTRYPOINT)]
    entrypoint: String,

    /// Remote default skeleton mask
    #[arg(long, env = "MASK_URL", default_value = DEFAULT_MASK_URL)]
    mask_url: String,

    /// Word preceding `is <number>` in engine output
    #[arg(long, env = "RESULT_LABEL", default_value = "result")]
    result_label: String,

    /// Aggregate report path [default: <root>/batch_results.csv]
    #[arg(long = "report", env = "REPORT_PATH")]
    report_path: Option<PathBuf>,

    /// Print outcome records as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn config(&self) -> Result<PipelineConfig, BatchError> {
        let mut config = PipelineConfig::new()
            .with_mode(self.mode)
            .with_runtime(self.runtime)
            .with_jobs(self.jobs)
            .with_thread_hint(self.threads)
            .with_mask_override(self.mask.clone())
            .with_result_label(self.result_label.clone());
        config.engine_image = self.engine_image.clone();
        config.entrypoint = self.entrypoint.clone();
        config.mask_url = self.mask_url.clone();
        config.report_path = self.report_path.clone();
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            let code = err.downcast_ref::<BatchError>().map_or(1, BatchError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(cli.config()?);
    tracing::info!(version = dwi_core::VERSION, mode = %config.mode, jobs = config.jobs, "starting");

    if !cli.target.is_dir() {
        return Err(BatchError::InvalidRoot(cli.target.clone()).into());
    }
    let target = std::path::absolute(&cli.target)
        .with_context(|| format!("resolving {}", cli.target.display()))?;

    match FileResolver::new().resolve(&target) {
        Ok(files) => {
            let shared_root = target.parent().unwrap_or(&target).to_path_buf();
            let pipeline = pipeline(&config, &shared_root);
            let record = pipeline.run(&Subject::new(&target, files)).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{}", record.status_line());
            }
        }
        Err(e) => {
            tracing::debug!("{} is not a subject ({e}), treating it as a batch root", target.display());
            run_batch(&config, &target, cli.json).await?;
        }
    }
    Ok(())
}

async fn run_batch(config: &Arc<PipelineConfig>, root: &Path, json: bool) -> anyhow::Result<()> {
    let subjects = BatchScheduler::discover(root)?;
    let scheduler = BatchScheduler::new(Arc::new(pipeline(config, root)), config);
    let summary = scheduler.run(subjects).await;

    let report = config
        .report_path
        .clone()
        .unwrap_or_else(|| default_report_path(root));
    let aggregator = ResultAggregator::new(dwi_core::ResultExtractor::new(&config.result_label));
    aggregator.aggregate(&summary.outcomes, &report)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for record in &summary.outcomes {
            println!("{}", record.status_line());
        }
        println!(
            "primary={} fallback={} fail={} report={}",
            summary.count(Method::Primary),
            summary.count(Method::Fallback),
            summary.count(Method::Fail),
            report.display()
        );
    }
    Ok(())
}

fn pipeline(config: &Arc<PipelineConfig>, shared_root: &Path) -> SubjectPipeline {
    let masks = Arc::new(MaskProvider::new(config, shared_root));
    SubjectPipeline::new(Arc::clone(config), Arc::new(ProcessRunner), masks)
}
