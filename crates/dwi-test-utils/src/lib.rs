//! Testing utilities for the DWI workspace
//!
//! On-disk study fixtures and a scripted command runner that answers for the
//! container runtime, the engine and every image tool.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dwi_core::{CommandRunner, Invocation, InvocationOutput};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const ENTRYPOINT: &str = "psmd.sh";

/// Temporary study root holding subject directories
pub struct Study {
    root: TempDir,
}

impl Study {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Complete subject: 3 volumes, 3x3 direction table, image
    pub fn add_subject(&self, name: &str) -> PathBuf {
        let dir = self.add_subject_without_image(name);
        fs::write(dir.join(format!("{name}_dwi.nii.gz")), b"\x1f\x8b").unwrap();
        dir
    }

    /// Gradient tables only; does not validate as a subject
    pub fn add_subject_without_image(&self, name: &str) -> PathBuf {
        let dir = self.root().join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{name}_dwi.bval")), "0 1000 1000\n").unwrap();
        fs::write(
            dir.join(format!("{name}_dwi.bvec")),
            "1 0 0\n0 1 0\n0 0 1\n",
        )
        .unwrap();
        dir
    }

    /// Shared default mask at the root
    pub fn with_shared_mask(self) -> Self {
        fs::write(self.root().join("skeleton_mask.nii.gz"), b"mask").unwrap();
        self
    }
}

impl Default for Study {
    fn default() -> Self {
        Self::new()
    }
}

type Script = dyn Fn(&Invocation) -> InvocationOutput + Send + Sync;

/// Answers invocations from a closure and records them
pub struct ScriptedRunner {
    script: Box<Script>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Invocation>>,
    engines: Mutex<InFlight>,
}

/// Engine calls running right now and the most seen at once
#[derive(Debug, Default)]
struct InFlight {
    running: usize,
    peak: usize,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&Invocation) -> InvocationOutput + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
            engines: Mutex::new(InFlight::default()),
        }
    }

    /// Engine answers come from `engine`; everything else from `fsl_default`
    pub fn engine(
        engine: impl Fn(&Invocation) -> InvocationOutput + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |inv| {
            if inv.program == ENTRYPOINT {
                engine(inv)
            } else {
                fsl_default(inv)
            }
        })
    }

    /// Sleep before answering engine invocations
    pub fn with_engine_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Engine invocations whose first argument is `flag`
    pub fn engine_calls(&self, flag: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.program == ENTRYPOINT && c.args.first().map(String::as_str) == Some(flag))
            .count()
    }

    /// Most engine invocations that were in flight at the same time
    pub fn peak_engine_calls(&self) -> usize {
        self.engines.lock().peak
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<InvocationOutput> {
        self.calls.lock().push(invocation.clone());
        if invocation.program != ENTRYPOINT {
            return Ok((self.script)(invocation));
        }

        {
            let mut engines = self.engines.lock();
            engines.running += 1;
            engines.peak = engines.peak.max(engines.running);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let output = (self.script)(invocation);
        self.engines.lock().running -= 1;
        Ok(output)
    }
}

/// Subject directory an engine invocation belongs to, from its working directory
pub fn subject_of(inv: &Invocation) -> Option<String> {
    let scratch = inv.cwd.as_ref()?;
    // <subject>/dti_pipeline/scratch
    let subject = scratch.parent()?.parent()?;
    subject.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Primary-mode engine call (`-p` or `-d`)
pub fn is_primary(inv: &Invocation) -> bool {
    matches!(inv.args.first().map(String::as_str), Some("-p" | "-d"))
}

/// Healthy environment: precheck passes, image tools succeed with a mask
/// large enough to skip the rescue pass
pub fn fsl_default(inv: &Invocation) -> InvocationOutput {
    match inv.program.as_str() {
        "sh" => InvocationOutput::ok(format!("/usr/local/bin/{ENTRYPOINT}\n/usr/local/bin/eddy\n")),
        "fslval" => InvocationOutput::ok("3\n"),
        "fslstats" if inv.args.iter().any(|a| a == "-V") => InvocationOutput::ok("48213 385704.000000\n"),
        "fslstats" => InvocationOutput::ok("10.000000 110.000000\n"),
        "fslroi" | "fslmaths" | "dtifit" => InvocationOutput::ok(""),
        other => InvocationOutput::failed(127, format!("sh: {other}: command not found\n")),
    }
}
