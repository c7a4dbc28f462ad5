//! Classification of abnormal worker terminations.

use crate::worker::{WorkerExit, WorkerReport};

use std::fmt;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, warn};

/// Why a job did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
  /// The job ran and reported an error: non-zero exit status, or the
  /// program could not be launched at all.
  ApplicationException,
  /// The worker process was killed by a signal.
  Signalled,
  /// The worker was killed by SIGKILL and its memory history is consistent
  /// with exhaustion. Best effort; such kills may also surface as `Signalled`.
  OutOfMemory,
  /// No result arrived before the per-job or per-drain deadline.
  Timeout,
  /// The pool was closed, or fail-fast stopped it, before the job finished.
  Cancelled,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::ApplicationException => "ApplicationException",
      Self::Signalled => "Signalled",
      Self::OutOfMemory => "OutOfMemory",
      Self::Timeout => "Timeout",
      Self::Cancelled => "Cancelled",
    };
    f.write_str(name)
  }
}

/// A diagnosable description of one failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFailure {
  kind: FailureKind,
  index: usize,
  message: String,
  signal: Option<i32>,
}

impl ClassifiedFailure {
  pub fn new(kind: FailureKind, index: usize, message: impl Into<String>) -> Self {
    Self {
      kind,
      index,
      message: message.into(),
      signal: None,
    }
  }

  fn with_signal(mut self, signal: i32) -> Self {
    self.signal = Some(signal);
    self
  }

  pub fn kind(&self) -> FailureKind {
    self.kind
  }

  /// Submission index of the job that failed.
  pub fn index(&self) -> usize {
    self.index
  }

  /// Captured error text, or a description of the termination.
  pub fn message(&self) -> &str {
    &self.message
  }

  /// The delivered signal, for `Signalled` and `OutOfMemory` failures.
  pub fn signal(&self) -> Option<i32> {
    self.signal
  }
}

impl fmt::Display for ClassifiedFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "job {}: {}: {}", self.index, self.kind, self.message)
  }
}

/// Turns raw worker terminations into [`ClassifiedFailure`]s.
///
/// Classification never fails: anything that cannot be explained degrades to
/// `Signalled` with an "unknown cause" message.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureDetector;

impl FailureDetector {
  pub fn new() -> Self {
    Self
  }

  /// Classifies an abnormal report. Returns `None` for a normal return value.
  pub fn classify(&self, report: &WorkerReport) -> Option<ClassifiedFailure> {
    let index = report.index;
    let failure = match &report.exit {
      WorkerExit::Returned(_) => return None,
      WorkerExit::Raised { code, message } => {
        // Without an explicit payload, the captured stderr is the traceback.
        let detail = if message.is_empty() { &report.stderr } else { message };
        let message = match code {
          Some(code) if detail.is_empty() => format!("exited with code {code}"),
          Some(code) => format!("exited with code {code}: {detail}"),
          None => detail.clone(),
        };
        ClassifiedFailure::new(FailureKind::ApplicationException, index, message)
      }
      WorkerExit::Signalled { signal } => self.classify_signal(report, *signal),
      WorkerExit::DeadlineExceeded(after) => self.deadline(index, *after),
      WorkerExit::Cancelled => self.cancelled(index, "worker was terminated before the job finished"),
      WorkerExit::Unknown(detail) => ClassifiedFailure::new(
        FailureKind::Signalled,
        index,
        format!("worker terminated for an unknown cause: {detail}"),
      ),
    };
    warn!(index, kind = %failure.kind, "Job failed: {}", failure.message);
    Some(failure)
  }

  /// Routes a report to its terminal outcome: the returned value, or the
  /// classified failure.
  pub fn outcome(&self, report: WorkerReport) -> Result<String, ClassifiedFailure> {
    if let Some(failure) = self.classify(&report) {
      return Err(failure);
    }
    match report.exit {
      WorkerExit::Returned(value) => Ok(value),
      other => Err(ClassifiedFailure::new(
        FailureKind::Signalled,
        report.index,
        format!("worker terminated for an unknown cause: {other:?}"),
      )),
    }
  }

  /// A job whose result did not arrive within `after`.
  pub fn deadline(&self, index: usize, after: Duration) -> ClassifiedFailure {
    ClassifiedFailure::new(
      FailureKind::Timeout,
      index,
      format!("no result within the deadline of {:.1}s", after.as_secs_f64()),
    )
  }

  pub fn cancelled(&self, index: usize, reason: &str) -> ClassifiedFailure {
    ClassifiedFailure::new(FailureKind::Cancelled, index, reason)
  }

  fn classify_signal(&self, report: &WorkerReport, signal: i32) -> ClassifiedFailure {
    let name = Signal::try_from(signal).map_or("unknown signal", Signal::as_str);
    let memory = &report.memory;

    // Heuristic: the kernel OOM reaper (and cgroup limits) deliver SIGKILL.
    // Only call it OOM when the memory history backs that up.
    let oom_like = memory.was_reaped() || memory.near_limit() || memory.is_rising();
    if signal == Signal::SIGKILL as i32 && oom_like {
      debug!(
        index = report.index,
        peak_bytes = memory.peak_bytes(),
        reaped = memory.was_reaped(),
        "SIGKILL with exhausted-memory profile, classifying as out of memory."
      );
      let limit = memory
        .limit_bytes()
        .map_or_else(|| "no limit configured".to_string(), |limit| format!("limit {limit} bytes"));
      return ClassifiedFailure::new(
        FailureKind::OutOfMemory,
        report.index,
        format!(
          "killed by {name} ({signal}) after reaching {} bytes resident ({limit})",
          memory.peak_bytes()
        ),
      )
      .with_signal(signal);
    }

    let mut message = format!("killed by {name} ({signal})");
    if !report.stderr.is_empty() {
      message.push_str(": ");
      message.push_str(&report.stderr);
    }
    ClassifiedFailure::new(FailureKind::Signalled, report.index, message).with_signal(signal)
  }
}
