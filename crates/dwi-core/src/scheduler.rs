//! Batch discovery and bounded fan-out
//!
//! Subjects are the immediate subdirectories of the root that resolve, in
//! lexicographic order. At most `jobs` pipelines run at once; a job slot is
//! taken before a subject's task is spawned and released when the task ends,
//! panics included.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{EngineMode, PipelineConfig};
use crate::diagnostics::DiagnosticLog;
use crate::error::BatchError;
use crate::pipeline::SubjectRunner;
use crate::resolver::FileResolver;
use crate::types::{Method, OutcomeRecord, Subject, OUTPUT_DIR_NAME};

/// Result of one batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// One record per subject, discovery order
    pub outcomes: Vec<OutcomeRecord>,
    /// Most subjects observed running at once
    pub peak_concurrency: usize,
}

impl BatchSummary {
    /// Subjects finished with `method`
    #[must_use]
    pub fn count(&self, method: Method) -> usize {
        self.outcomes.iter().filter(|o| o.method == method).count()
    }
}

#[derive(Debug, Default)]
struct Occupancy {
    running: usize,
    peak: usize,
}

/// Decrements the running count when a task ends, however it ends
struct SlotGuard(Arc<Mutex<Occupancy>>);

impl SlotGuard {
    fn enter(occupancy: Arc<Mutex<Occupancy>>) -> Self {
        {
            let mut o = occupancy.lock();
            o.running += 1;
            o.peak = o.peak.max(o.running);
        }
        Self(occupancy)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.lock().running -= 1;
    }
}

/// Discovers subjects and runs them under a bounded worker pool
#[derive(Clone)]
pub struct BatchScheduler {
    runner: Arc<dyn SubjectRunner>,
    jobs: usize,
    mode: EngineMode,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler").field("jobs", &self.jobs).finish_non_exhaustive()
    }
}

impl BatchScheduler {
    /// Scheduler running at most `config.jobs` subjects at once (at least one)
    #[must_use]
    pub fn new(runner: Arc<dyn SubjectRunner>, config: &PipelineConfig) -> Self {
        Self {
            runner,
            jobs: config.jobs.max(1),
            mode: config.mode,
        }
    }

    /// Immediate subdirectories of `root` that resolve as subjects
    ///
    /// # Errors
    /// `InvalidRoot` when `root` is not a directory, `NoValidSubjects` when
    /// nothing under it resolves.
    pub fn discover(root: &Path) -> Result<Vec<Subject>, BatchError> {
        if !root.is_dir() {
            return Err(BatchError::InvalidRoot(root.to_path_buf()));
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.') || n == OUTPUT_DIR_NAME);
            if path.is_dir() && !hidden {
                dirs.push(path);
            }
        }
        dirs.sort();

        let resolver = FileResolver::new();
        let subjects: Vec<Subject> = dirs
            .into_iter()
            .filter_map(|dir| match resolver.resolve(&dir) {
                Ok(files) => Some(Subject::new(dir, files)),
                Err(e) => {
                    tracing::info!("skipping {}: {e}", dir.display());
                    None
                }
            })
            .collect();

        if subjects.is_empty() {
            return Err(BatchError::NoValidSubjects(root.to_path_buf()));
        }
        tracing::info!(count = subjects.len(), "discovered subjects");
        Ok(subjects)
    }

    /// Run every subject; one record each, in input order
    pub async fn run(&self, subjects: Vec<Subject>) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", %run_id, subjects = subjects.len(), jobs = self.jobs);
        self.fan_out(run_id, subjects).instrument(span).await
    }

    async fn fan_out(&self, run_id: Uuid, subjects: Vec<Subject>) -> BatchSummary {
        let semaphore = Arc::new(Semaphore::new(self.jobs));
        let occupancy = Arc::new(Mutex::new(Occupancy::default()));
        let mut tasks = Vec::with_capacity(subjects.len());

        for subject in subjects {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!("job slots closed: {e}");
                    tasks.push((subject, None));
                    continue;
                }
            };
            let runner = Arc::clone(&self.runner);
            let occupancy = Arc::clone(&occupancy);
            let task_subject = subject.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let _slot = SlotGuard::enter(occupancy);
                    runner.run(&task_subject).await
                }
                .in_current_span(),
            );
            tasks.push((subject, Some(handle)));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (subject, handle) in tasks {
            let record = match handle {
                Some(handle) => match handle.await {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::error!(subject = %subject.id, "subject task failed: {e}");
                        let mut record = OutcomeRecord::failed(&subject, self.mode, "panicked");
                        record.diagnostic_log = DiagnosticLog::latest(&subject.layout());
                        record
                    }
                },
                None => OutcomeRecord::failed(&subject, self.mode, "not_scheduled"),
            };
            outcomes.push(record);
        }

        let peak_concurrency = occupancy.lock().peak;
        let summary = BatchSummary {
            run_id,
            outcomes,
            peak_concurrency,
        };
        tracing::info!(
            primary = summary.count(Method::Primary),
            fallback = summary.count(Method::Fallback),
            fail = summary.count(Method::Fail),
            peak_concurrency,
            "batch finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MockSubjectRunner;
    use crate::types::ResolvedFiles;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_subject(root: &Path, name: &str, with_image: bool) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("dwi.bval"), "0 1000\n").unwrap();
        fs::write(dir.join("dwi.bvec"), "1 0\n0 1\n0 0\n").unwrap();
        if with_image {
            fs::write(dir.join("dwi.nii.gz"), b"img").unwrap();
        }
    }

    fn subject(name: &str) -> Subject {
        Subject::new(
            PathBuf::from("/d").join(name),
            ResolvedFiles {
                bval: "b".into(),
                bvec: "r".into(),
                image: "i".into(),
            },
        )
    }

    #[test]
    fn discovery_is_sorted_and_skips_invalid() {
        let root = tempfile::tempdir().unwrap();
        write_subject(root.path(), "sub-02", true);
        write_subject(root.path(), "sub-01", true);
        write_subject(root.path(), "sub-03", false);
        fs::create_dir(root.path().join(".cache")).unwrap();

        let subjects = BatchScheduler::discover(root.path()).unwrap();
        let ids: Vec<_> = subjects.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["sub-01", "sub-02"]);
    }

    #[test]
    fn discovery_errors() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            BatchScheduler::discover(&root.path().join("missing")),
            Err(BatchError::InvalidRoot(_))
        ));
        write_subject(root.path(), "sub-01", false);
        assert!(matches!(
            BatchScheduler::discover(root.path()),
            Err(BatchError::NoValidSubjects(_))
        ));
    }

    fn primary(s: &Subject, value: f64) -> OutcomeRecord {
        let mut record = OutcomeRecord::failed(s, EngineMode::Direct, "x");
        record.method = Method::Primary;
        record.value = Some(value);
        record.failure = None;
        record
    }

    /// Sleeps, then succeeds; panics for `sub-02`. Counts overlapping runs.
    #[derive(Default)]
    struct Sleepy {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SubjectRunner for Sleepy {
        async fn run(&self, subject: &Subject) -> OutcomeRecord {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if subject.id == "sub-02" {
                panic!("boom");
            }
            primary(subject, 1.0)
        }
    }

    #[tokio::test]
    async fn records_keep_input_order() {
        let mut runner = MockSubjectRunner::new();
        runner.expect_run().times(3).returning(|s| primary(s, 2.45));
        let scheduler = BatchScheduler::new(Arc::new(runner), &PipelineConfig::new());

        let summary = scheduler
            .run(vec![subject("b"), subject("a"), subject("c")])
            .await;
        let ids: Vec<_> = summary.outcomes.iter().map(|o| o.subject.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(summary.peak_concurrency, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_subject_becomes_fail_record() {
        let config = PipelineConfig::new().with_jobs(2);
        let runner = Arc::new(Sleepy::default());
        let scheduler = BatchScheduler::new(Arc::<Sleepy>::clone(&runner), &config);

        let names = ["sub-01", "sub-02", "sub-03", "sub-04", "sub-05"];
        let summary = scheduler.run(names.iter().map(|n| subject(n)).collect()).await;

        let ids: Vec<_> = summary.outcomes.iter().map(|o| o.subject.as_str()).collect();
        assert_eq!(ids, names);
        assert_eq!(summary.outcomes[1].failure.as_deref(), Some("panicked"));
        assert_eq!(summary.count(Method::Primary), 4);
        assert_eq!(summary.count(Method::Fail), 1);
        assert_eq!(summary.peak_concurrency, 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slots_fill_up_to_the_limit() {
        let config = PipelineConfig::new().with_jobs(3);
        let runner = Arc::new(Sleepy::default());
        let scheduler = BatchScheduler::new(Arc::<Sleepy>::clone(&runner), &config);

        let names = ["sub-01", "sub-03", "sub-04", "sub-05", "sub-06", "sub-07"];
        let summary = scheduler.run(names.iter().map(|n| subject(n)).collect()).await;

        assert_eq!(summary.count(Method::Primary), 6);
        assert_eq!(summary.peak_concurrency, 3);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 3);
    }
}
