//! End-to-end batch scenarios
//!
//! Native runtime with a scripted runner standing in for the engine and the
//! image tools; everything else (files, logs, report) is real.

use std::sync::Arc;
use std::time::Duration;

use dwi_core::prelude::*;
use dwi_core::{ContainerRuntime, InvocationOutput};
use dwi_test_utils::{is_primary, subject_of, ScriptedRunner, Study};
use pretty_assertions::assert_eq;

struct Outcome {
    summary: BatchSummary,
    report: Vec<String>,
}

async fn run_batch(study: &Study, runner: Arc<ScriptedRunner>, jobs: usize) -> Outcome {
    let config = Arc::new(
        PipelineConfig::new()
            .with_runtime(ContainerRuntime::Native)
            .with_jobs(jobs),
    );
    let masks = Arc::new(MaskProvider::new(&config, study.root()));
    let pipeline = SubjectPipeline::new(Arc::clone(&config), runner, masks);
    let scheduler = BatchScheduler::new(Arc::new(pipeline), &config);

    let subjects = BatchScheduler::discover(study.root()).unwrap();
    let summary = scheduler.run(subjects).await;

    let path = default_report_path(study.root());
    ResultAggregator::default()
        .aggregate(&summary.outcomes, &path)
        .unwrap();
    let report = std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    Outcome { summary, report }
}

/// First four CSV columns
fn head(line: &str) -> String {
    line.split(',').take(4).collect::<Vec<_>>().join(",")
}

#[tokio::test]
async fn primary_result_is_reported() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    let runner = ScriptedRunner::engine(|_| InvocationOutput::ok("skeletonizing\nresult is 2.45\n")).into_arc();

    let out = run_batch(&study, Arc::clone(&runner), 1).await;

    assert_eq!(
        out.report[0],
        "subject,mode,method,value,primary_log,fallback_log,diagnostic_log"
    );
    assert_eq!(head(&out.report[1]), "sub-01,preprocessing,primary,2.45");
    assert_eq!(runner.engine_calls("-f"), 0);

    let record = &out.summary.outcomes[0];
    let diag = std::fs::read_to_string(record.diagnostic_log.as_ref().unwrap()).unwrap();
    assert!(diag.trim_end().ends_with("STATUS sub-01 method=primary value=2.45"));
}

#[tokio::test]
async fn abort_marker_falls_back() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    let runner = ScriptedRunner::engine(|inv| {
        if is_primary(inv) {
            InvocationOutput::ok("running eddy\nAbort: eddy_cuda not found\n")
        } else {
            InvocationOutput::ok("from maps\nresult is 1.98\n")
        }
    })
    .into_arc();

    let out = run_batch(&study, Arc::clone(&runner), 1).await;

    assert_eq!(head(&out.report[1]), "sub-01,preprocessing,fallback,1.98");
    let calls = runner.calls();
    let roi = calls.iter().find(|c| c.program == "fslroi").unwrap();
    // first value below 50 is at position 0
    assert_eq!(roi.args[2], "0");
    let maths = calls.iter().find(|c| c.program == "fslmaths").unwrap();
    assert_eq!(maths.args[1..3], ["-thr".to_string(), "30".to_string()]);
    assert!(calls.iter().any(|c| c.program == "dtifit"));
}

#[tokio::test]
async fn no_result_anywhere_is_fail_with_empty_value() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    let runner = ScriptedRunner::engine(|_| InvocationOutput::ok("finished without output\n")).into_arc();

    let out = run_batch(&study, runner, 1).await;

    assert_eq!(head(&out.report[1]), "sub-01,preprocessing,fail,");
    assert_eq!(out.summary.count(Method::Fail), 1);
    let record = &out.summary.outcomes[0];
    assert!(record.primary_log.is_some());
    assert!(record.fallback_log.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_subjects_two_slots() {
    let study = Study::new().with_shared_mask();
    for i in 1..=5 {
        study.add_subject(&format!("sub-0{i}"));
    }
    let runner = ScriptedRunner::engine(|inv| {
        let value = match subject_of(inv).as_deref() {
            Some("sub-03") => "3.5",
            _ => "2.0",
        };
        InvocationOutput::ok(format!("result is {value}\n"))
    })
    .with_engine_delay(Duration::from_millis(50))
    .into_arc();

    let out = run_batch(&study, Arc::clone(&runner), 2).await;

    assert_eq!(out.report.len(), 6);
    let subjects: Vec<_> = out.report[1..]
        .iter()
        .map(|l| l.split(',').next().unwrap().to_string())
        .collect();
    assert_eq!(subjects, ["sub-01", "sub-02", "sub-03", "sub-04", "sub-05"]);
    assert_eq!(head(&out.report[3]), "sub-03,preprocessing,primary,3.5");
    assert_eq!(out.summary.peak_concurrency, 2);
    // two engines overlapped, never three
    assert_eq!(runner.peak_engine_calls(), 2);
}

#[tokio::test]
async fn directory_without_image_is_not_a_subject() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    study.add_subject_without_image("sub-02");
    study.add_subject("sub-03");
    let runner = ScriptedRunner::engine(|_| InvocationOutput::ok("result is 2.45\n")).into_arc();

    let out = run_batch(&study, runner, 1).await;

    assert_eq!(out.report.len(), 3);
    assert!(out.report.iter().all(|l| !l.starts_with("sub-02")));
}

#[tokio::test]
async fn missing_dependency_skips_primary() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    let runner = ScriptedRunner::new(|inv| match inv.program.as_str() {
        "sh" => InvocationOutput::failed(1, "/usr/local/bin/psmd.sh\n"),
        "psmd.sh" => InvocationOutput::ok("result is 1.75\n"),
        _ => dwi_test_utils::fsl_default(inv),
    })
    .into_arc();

    let out = run_batch(&study, Arc::clone(&runner), 1).await;

    assert_eq!(runner.engine_calls("-p"), 0);
    assert_eq!(runner.engine_calls("-f"), 1);
    assert_eq!(head(&out.report[1]), "sub-01,preprocessing,fallback,1.75");
    assert!(out.summary.outcomes[0].primary_log.is_none());
}

#[tokio::test]
async fn crashed_subject_still_gets_status_line() {
    let study = Study::new().with_shared_mask();
    study.add_subject("sub-01");
    study.add_subject("sub-02");
    let runner = ScriptedRunner::engine(|inv| {
        if subject_of(inv).as_deref() == Some("sub-02") {
            panic!("engine wrapper crashed");
        }
        InvocationOutput::ok("result is 2.45\n")
    })
    .into_arc();

    let out = run_batch(&study, runner, 1).await;

    assert_eq!(head(&out.report[1]), "sub-01,preprocessing,primary,2.45");
    assert_eq!(head(&out.report[2]), "sub-02,preprocessing,fail,");
    let record = &out.summary.outcomes[1];
    assert_eq!(record.failure.as_deref(), Some("panicked"));
    let diag = std::fs::read_to_string(record.diagnostic_log.as_ref().unwrap()).unwrap();
    assert!(diag.trim_end().ends_with("STATUS sub-02 method=fail value=NA"));
}

#[test]
fn empty_root_has_no_valid_subjects() {
    let study = Study::new();
    study.add_subject_without_image("sub-01");
    let err = BatchScheduler::discover(study.root()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}
