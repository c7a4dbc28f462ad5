use crate::error::PoolError;
use crate::memory::MemorySize;
use crate::progress::ProgressSink;

use std::time::Duration;

/// Per-job deadline used when none is configured (about three hours).
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10_000);

/// Settings for a [`JobPool`](crate::JobPool).
///
/// Start from [`PoolConfig::new`] and adjust with the `with_*` methods;
/// everything is checked when the pool is constructed.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub(crate) worker_count: usize,
  pub(crate) pool_name: String,
  pub(crate) fail_fast: bool,
  pub(crate) job_timeout: Option<Duration>,
  pub(crate) drain_timeout: Option<Duration>,
  pub(crate) poll_interval: Duration,
  pub(crate) progress_every: usize,
  pub(crate) progress_sink: ProgressSink,
  pub(crate) memory_limit: Option<MemorySize>,
  pub(crate) memory_sample_interval: Duration,
  pub(crate) threads_per_job: Option<usize>,
  pub(crate) handle_interrupts: bool,
}

impl PoolConfig {
  pub fn new(worker_count: usize) -> Self {
    Self {
      worker_count,
      pool_name: "job_pool".to_string(),
      fail_fast: false,
      job_timeout: Some(DEFAULT_JOB_TIMEOUT),
      drain_timeout: None,
      poll_interval: Duration::from_secs(1),
      progress_every: 0,
      progress_sink: ProgressSink::Log,
      memory_limit: None,
      memory_sample_interval: Duration::from_millis(50),
      threads_per_job: None,
      handle_interrupts: true,
    }
  }

  #[must_use]
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.pool_name = name.into();
    self
  }

  /// Stop at the first failed job instead of waiting for all of them.
  #[must_use]
  pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
    self.fail_fast = fail_fast;
    self
  }

  /// Deadline for each individual job, measured from process start.
  #[must_use]
  pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.job_timeout = timeout;
    self
  }

  /// Deadline for a whole `drain` call.
  #[must_use]
  pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.drain_timeout = timeout;
    self
  }

  #[must_use]
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  /// Default cadence for `drain`; 0 lets the reporter choose.
  #[must_use]
  pub fn with_progress_every(mut self, every: usize) -> Self {
    self.progress_every = every;
    self
  }

  #[must_use]
  pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
    self.progress_sink = sink;
    self
  }

  /// Resident-memory cap per worker process. Workers above it are killed
  /// with SIGKILL, the same way a cgroup limit would.
  #[must_use]
  pub fn with_memory_limit(mut self, limit: Option<MemorySize>) -> Self {
    self.memory_limit = limit;
    self
  }

  #[must_use]
  pub fn with_memory_sample_interval(mut self, interval: Duration) -> Self {
    self.memory_sample_interval = interval;
    self
  }

  /// Thread budget for numeric libraries inside each worker. `None` divides
  /// the available CPUs among the workers.
  #[must_use]
  pub fn with_threads_per_job(mut self, threads: Option<usize>) -> Self {
    self.threads_per_job = threads;
    self
  }

  /// Listen for Ctrl-C (SIGINT) while the pool is open. On an interrupt the
  /// worker process groups are killed and a running `drain` returns
  /// `PoolError::Interrupted`. Turn this off to handle SIGINT yourself, for
  /// example by calling `close`.
  ///
  /// Once Tokio listens for SIGINT the default "terminate the process" action
  /// stays disabled for the rest of the program.
  #[must_use]
  pub fn with_interrupt_handling(mut self, enabled: bool) -> Self {
    self.handle_interrupts = enabled;
    self
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub fn fail_fast(&self) -> bool {
    self.fail_fast
  }

  pub(crate) fn validate(&self) -> Result<(), PoolError> {
    if self.worker_count == 0 {
      return Err(PoolError::Configuration("worker_count must be at least 1".into()));
    }
    if self.poll_interval.is_zero() {
      return Err(PoolError::Configuration("poll_interval must be greater than zero".into()));
    }
    if self.memory_sample_interval.is_zero() {
      return Err(PoolError::Configuration(
        "memory_sample_interval must be greater than zero".into(),
      ));
    }
    if self.threads_per_job == Some(0) {
      return Err(PoolError::Configuration("threads_per_job must be at least 1".into()));
    }
    if self.job_timeout.is_some_and(|t| t.is_zero()) || self.drain_timeout.is_some_and(|t| t.is_zero()) {
      return Err(PoolError::Configuration("timeouts must be greater than zero".into()));
    }
    Ok(())
  }
}
