//! Per-subject diagnostic log
//!
//! A plain-text file under the subject's output directory, one timestamped
//! line per event, closed by the `STATUS` line. Every line is mirrored to
//! `tracing` at debug level. Write failures never affect the pipeline.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::types::{OutcomeRecord, SubjectLayout};

/// File-name timestamp format
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Timestamped diagnostic writer
#[derive(Debug)]
pub struct DiagnosticLog {
    path: Option<PathBuf>,
    file: Option<File>,
    abandoned: Option<OutcomeRecord>,
}

impl DiagnosticLog {
    /// Open `diagnostic_<stamp>.log` for `started`
    pub fn create(layout: &SubjectLayout, started: DateTime<Local>) -> Self {
        let path = layout.diagnostic_log(&started.format(STAMP_FORMAT).to_string());
        let opened = std::fs::create_dir_all(layout.root())
            .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => Self {
                path: Some(path),
                file: Some(file),
                abandoned: None,
            },
            Err(e) => {
                tracing::warn!("diagnostic log {} unavailable: {e}", path.display());
                Self::disabled()
            }
        }
    }

    /// Writer that only mirrors to tracing
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            abandoned: None,
        }
    }

    /// Most recent `diagnostic_*.log` under `layout`
    #[must_use]
    pub fn latest(layout: &SubjectLayout) -> Option<PathBuf> {
        let pattern = format!(
            "{}/diagnostic_*.log",
            glob::Pattern::escape(&layout.root().to_string_lossy())
        );
        glob::glob(&pattern).ok()?.filter_map(Result::ok).max()
    }

    /// Log file, if it was created
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line
    pub fn line(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!("{message}");
        if let Some(file) = &mut self.file {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            if let Err(e) = writeln!(file, "[{stamp}] {message}") {
                tracing::warn!("diagnostic write failed: {e}");
                self.file = None;
            }
        }
    }

    /// Titled block of lines
    pub fn section<I, S>(&mut self, title: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.line(format!("== {title}"));
        for l in lines {
            self.line(format!("   {}", l.as_ref()));
        }
    }

    /// Status written if the log is dropped before `finish`
    pub fn on_abandon(&mut self, record: OutcomeRecord) {
        self.abandoned = Some(record);
    }

    /// Write the final status line and close
    pub fn finish(mut self, record: &OutcomeRecord) {
        self.abandoned = None;
        self.write_status(record);
    }

    fn write_status(&mut self, record: &OutcomeRecord) {
        if let Some(reason) = &record.failure {
            self.line(format!("failure: {reason}"));
        }
        self.line(record.status_line());
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
    }
}

impl Drop for DiagnosticLog {
    fn drop(&mut self) {
        if let Some(record) = self.abandoned.take() {
            self.line("run abandoned before completion");
            self.write_status(&record);
        }
    }
}
