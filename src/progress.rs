use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

/// Roughly how many progress lines an automatic cadence produces per drain.
const AUTO_UPDATES: usize = 20;

/// Where progress lines go.
#[derive(Clone, Default)]
pub enum ProgressSink {
  /// Drop progress output.
  Silent,
  /// Emit an `info` tracing event per update.
  #[default]
  Log,
  /// Write one line per update to the given writer.
  Writer(Arc<Mutex<Box<dyn Write + Send>>>),
}

impl ProgressSink {
  pub fn writer(writer: impl Write + Send + 'static) -> Self {
    Self::Writer(Arc::new(Mutex::new(Box::new(writer))))
  }

  pub fn stdout() -> Self {
    Self::writer(io::stdout())
  }

  pub fn stderr() -> Self {
    Self::writer(io::stderr())
  }
}

impl fmt::Debug for ProgressSink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Silent => f.write_str("Silent"),
      Self::Log => f.write_str("Log"),
      Self::Writer(_) => f.write_str("Writer(..)"),
    }
  }
}

/// Formats and emits progress lines. Holds no counters of its own; the pool
/// passes the current numbers on every call.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
  sink: ProgressSink,
  every: usize,
}

impl ProgressReporter {
  /// `every == 0` picks a cadence from the job total.
  pub fn new(sink: ProgressSink, every: usize) -> Self {
    Self { sink, every }
  }

  fn cadence(&self, total: usize) -> usize {
    if self.every > 0 {
      self.every
    } else {
      (total / AUTO_UPDATES).max(1)
    }
  }

  /// Whether an update is due at `completed`. The final completion always is.
  pub fn should_report(&self, completed: usize, total: usize) -> bool {
    completed > 0 && (completed == total || completed % self.cadence(total) == 0)
  }

  pub fn format(completed: usize, total: usize, elapsed: Duration) -> String {
    let percent = if total == 0 { 100 } else { completed * 100 / total };
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { completed as f64 / secs } else { 0.0 };
    format!("{completed}/{total} jobs done ({percent}%) in {secs:.1}s, {rate:.2} jobs/s")
  }

  /// Emits one progress line. Write errors are ignored.
  pub fn report(&self, completed: usize, total: usize, elapsed: Duration) {
    match &self.sink {
      ProgressSink::Silent => {}
      ProgressSink::Log => info!(completed, total, "{}", Self::format(completed, total, elapsed)),
      ProgressSink::Writer(writer) => {
        let line = Self::format(completed, total, elapsed);
        let mut writer = writer.lock();
        let _ = writeln!(writer, "{line}").and_then(|()| writer.flush());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Clone, Default)]
  struct SharedBuf(Arc<Mutex<Vec<u8>>>);

  impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  struct BrokenPipe;

  impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
      Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
      Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }
  }

  #[test]
  fn explicit_cadence_reports_every_n_and_at_the_end() {
    let reporter = ProgressReporter::new(ProgressSink::Silent, 3);
    let due: Vec<usize> = (0..=10).filter(|&c| reporter.should_report(c, 10)).collect();
    assert_eq!(due, vec![3, 6, 9, 10]);
  }

  #[test]
  fn automatic_cadence_scales_with_total() {
    let reporter = ProgressReporter::new(ProgressSink::Silent, 0);
    assert!(reporter.should_report(1, 5));
    assert!(reporter.should_report(50, 1000));
    assert!(!reporter.should_report(51, 1000));
    assert!(reporter.should_report(1000, 1000));
  }

  #[test]
  fn writes_formatted_line_to_writer() {
    let buf = SharedBuf::default();
    let reporter = ProgressReporter::new(ProgressSink::writer(buf.clone()), 1);
    reporter.report(5, 20, Duration::from_secs(2));

    let text = String::from_utf8(buf.0.lock().clone()).unwrap();
    assert_eq!(text, "5/20 jobs done (25%) in 2.0s, 2.50 jobs/s\n");
  }

  #[test]
  fn write_errors_are_swallowed() {
    let reporter = ProgressReporter::new(ProgressSink::writer(BrokenPipe), 1);
    reporter.report(1, 1, Duration::ZERO);
  }
}
