//! Uniform external invocation
//!
//! Every external program (engine, dependency precheck, image tools) goes
//! through one path:
//!
//! ```text
//! program + args ──Launcher──▶ Invocation ──CommandRunner──▶ InvocationOutput
//!                 (docker / apptainer / native)     (one OS process)
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ContainerRuntime, PipelineConfig};

/// A fully launched command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program on the host
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Working directory on the host
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    /// Bare invocation
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status plus combined captured text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutput {
    /// Exit code; `None` when killed by a signal
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr
    pub text: String,
}

impl InvocationOutput {
    /// Successful output with `text`
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            text: text.into(),
        }
    }

    /// Failed output with `code` and `text`
    #[must_use]
    pub fn failed(code: i32, text: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            text: text.into(),
        }
    }

    /// Exit code zero
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one invocation as one OS process
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output
    ///
    /// # Errors
    /// Only when the process could not be started at all.
    async fn run(&self, invocation: &Invocation) -> std::io::Result<InvocationOutput>;
}

/// `tokio::process` backed runner
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<InvocationOutput> {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }

        tracing::debug!("spawning: {}", invocation.command_line());
        let output = cmd.output().await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(InvocationOutput {
            exit_code: output.status.code(),
            text,
        })
    }
}

/// Where an invocation may read/write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// Directory made visible to the program (the subject directory)
    pub mount: PathBuf,
    /// Writable scratch directory, distinct from the inputs
    pub work_dir: PathBuf,
}

impl Scope {
    /// New scope
    #[must_use]
    pub fn new(mount: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            work_dir: work_dir.into(),
        }
    }
}

/// Wraps programs for the configured container runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    runtime: ContainerRuntime,
    image: String,
    thread_hint: usize,
}

impl Launcher {
    /// New launcher
    #[must_use]
    pub fn new(runtime: ContainerRuntime, image: impl Into<String>, thread_hint: usize) -> Self {
        Self {
            runtime,
            image: image.into(),
            thread_hint: thread_hint.max(1),
        }
    }

    /// From run configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.runtime, config.engine_image.clone(), config.thread_hint)
    }

    /// Build the host command line for `program args…` inside `scope`
    #[must_use]
    pub fn wrap(&self, program: &str, args: &[String], scope: &Scope) -> Invocation {
        let threads = self.thread_hint.to_string();
        let mount = path_arg(&scope.mount);
        let work = path_arg(&scope.work_dir);

        match self.runtime {
            ContainerRuntime::Docker => Invocation::new("docker")
                .args([
                    "run".to_string(),
                    "--rm".to_string(),
                    "-v".to_string(),
                    format!("{mount}:{mount}"),
                    "-w".to_string(),
                    work,
                    "-e".to_string(),
                    format!("OMP_NUM_THREADS={threads}"),
                    self.image.clone(),
                    program.to_string(),
                ])
                .args(args.iter().cloned()),
            ContainerRuntime::Apptainer => Invocation::new("apptainer")
                .args([
                    "exec".to_string(),
                    "--bind".to_string(),
                    mount,
                    "--pwd".to_string(),
                    work,
                    "--env".to_string(),
                    format!("OMP_NUM_THREADS={threads}"),
                    apptainer_uri(&self.image),
                    program.to_string(),
                ])
                .args(args.iter().cloned()),
            ContainerRuntime::Native => {
                let mut inv = Invocation::new(program).args(args.iter().cloned());
                inv.env.push(("OMP_NUM_THREADS".to_string(), threads));
                inv.cwd = Some(scope.work_dir.clone());
                inv
            }
        }
    }
}

/// Apptainer needs a URI unless it is given a local image file
fn apptainer_uri(image: &str) -> String {
    if image.contains("://") || image.ends_with(".sif") {
        image.to_string()
    } else {
        format!("docker://{image}")
    }
}

/// Path as a command-line argument
#[must_use]
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Launcher plus runner: the single invocation path shared by all stages
#[derive(Clone)]
pub struct Invoker {
    launcher: Launcher,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").field("launcher", &self.launcher).finish()
    }
}

impl Invoker {
    /// New invoker
    #[must_use]
    pub fn new(launcher: Launcher, runner: Arc<dyn CommandRunner>) -> Self {
        Self { launcher, runner }
    }

    /// Run `program args…` through the launcher
    pub async fn invoke(
        &self,
        program: &str,
        args: &[String],
        scope: &Scope,
    ) -> std::io::Result<InvocationOutput> {
        let invocation = self.launcher.wrap(program, args, scope);
        let output = self.runner.run(&invocation).await?;
        tracing::debug!(
            program,
            exit_code = ?output.exit_code,
            bytes = output.text.len(),
            "invocation finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new("/data/sub-01", "/data/sub-01/dti_pipeline/scratch")
    }

    #[test]
    fn docker_wrapping_mounts_subject_dir() {
        let launcher = Launcher::new(ContainerRuntime::Docker, "img:1", 4);
        let inv = launcher.wrap("fslval", &["a.nii.gz".into(), "dim4".into()], &scope());
        assert_eq!(inv.program, "docker");
        assert_eq!(
            inv.command_line(),
            "docker run --rm -v /data/sub-01:/data/sub-01 -w /data/sub-01/dti_pipeline/scratch \
             -e OMP_NUM_THREADS=4 img:1 fslval a.nii.gz dim4"
        );
    }

    #[test]
    fn apptainer_gets_docker_uri() {
        let launcher = Launcher::new(ContainerRuntime::Apptainer, "ghcr.io/x/psmd:latest", 1);
        let inv = launcher.wrap("psmd.sh", &[], &scope());
        assert!(inv.args.contains(&"docker://ghcr.io/x/psmd:latest".to_string()));

        let local = Launcher::new(ContainerRuntime::Apptainer, "/opt/psmd.sif", 1);
        let inv = local.wrap("psmd.sh", &[], &scope());
        assert!(inv.args.contains(&"/opt/psmd.sif".to_string()));
    }

    #[test]
    fn native_sets_cwd_and_threads() {
        let launcher = Launcher::new(ContainerRuntime::Native, "", 0);
        let inv = launcher.wrap("dtifit", &["-k".into()], &scope());
        assert_eq!(inv.program, "dtifit");
        assert_eq!(inv.cwd, Some(PathBuf::from("/data/sub-01/dti_pipeline/scratch")));
        assert_eq!(inv.env, vec![("OMP_NUM_THREADS".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn invoker_passes_wrapped_command_to_runner() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.program == "fslval" && inv.args == ["img", "dim4"])
            .times(1)
            .returning(|_| Ok(InvocationOutput::ok("64\n")));

        let invoker = Invoker::new(
            Launcher::new(ContainerRuntime::Native, "", 1),
            Arc::new(runner),
        );
        let out = invoker
            .invoke("fslval", &["img".into(), "dim4".into()], &scope())
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.text, "64\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_combines_stdout_and_stderr() {
        let inv = Invocation::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let out = ProcessRunner.run(&inv).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.text, "out\nerr\n");
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failure() {
        let inv = Invocation::new("definitely-not-a-real-program-xyz");
        assert!(ProcessRunner.run(&inv).await.is_err());
    }
}
