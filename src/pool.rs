use crate::collector::ResultCollector;
use crate::config::PoolConfig;
use crate::error::{AggregateFailure, PoolError};
use crate::failure::{ClassifiedFailure, FailureDetector};
use crate::handle::{JobHandle, JobOutcome};
use crate::invocation::Invocation;
use crate::progress::ProgressReporter;
use crate::worker::{ProcessWorkerPool, WorkerPool, WorkerReport, WorkerSettings};

use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Bookkeeping owned by one `JobPool`. Only the orchestrating task touches it.
#[derive(Debug)]
struct PoolState {
  worker_count: usize,
  submitted: Vec<JobHandle>,
  completed_count: usize,
}

#[derive(Debug)]
enum Lifecycle {
  Open,
  Closed,
  Drained(Result<Vec<String>, PoolError>),
}

/// Submits jobs to a bounded group of worker processes and hands back their
/// results in submission order.
///
/// ```no_run
/// # async fn demo() -> Result<(), job_pool::PoolError> {
/// use job_pool::{Invocation, JobPool};
///
/// let mut pool = JobPool::new(4)?;
/// for i in 0..20 {
///   pool.submit(Invocation::shell(format!("echo $(({i} + 1))")))?;
/// }
/// let results = pool.drain(None).await?;
/// assert_eq!(results.len(), 20);
/// # Ok(())
/// # }
/// ```
pub struct JobPool<W: WorkerPool = ProcessWorkerPool> {
  pool_name: Arc<String>,
  config: PoolConfig,
  workers: W,
  reports: mpsc::UnboundedReceiver<WorkerReport>,
  state: PoolState,
  collector: ResultCollector<Result<String, ClassifiedFailure>>,
  detector: FailureDetector,
  lifecycle: Lifecycle,
}

impl<W: WorkerPool + std::fmt::Debug> std::fmt::Debug for JobPool<W> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobPool")
      .field("pool_name", &self.pool_name)
      .field("workers", &self.workers)
      .field("submitted", &self.state.submitted.len())
      .field("completed", &self.state.completed_count)
      .field("lifecycle", &self.lifecycle)
      .finish_non_exhaustive()
  }
}

impl JobPool<ProcessWorkerPool> {
  /// A pool of `worker_count` worker processes with default settings.
  ///
  /// # Errors
  /// `PoolError::Configuration` if `worker_count` is 0 or no Tokio runtime is running.
  pub fn new(worker_count: usize) -> Result<Self, PoolError> {
    Self::with_config(PoolConfig::new(worker_count))
  }

  pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
    config.validate()?;
    let tokio_handle = TokioHandle::try_current()
      .map_err(|e| PoolError::Configuration(format!("a JobPool must be created inside a Tokio runtime: {e}")))?;
    let (workers, reports) =
      ProcessWorkerPool::spawn(WorkerSettings::from_config(&config), tokio_handle, &config.pool_name);
    Self::from_parts(config, workers, reports)
  }
}

impl<W: WorkerPool> JobPool<W> {
  /// Builds a pool around any worker-pool implementation and its completion channel.
  pub fn from_parts(
    config: PoolConfig,
    workers: W,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
  ) -> Result<Self, PoolError> {
    config.validate()?;
    let pool_name = Arc::new(config.pool_name.clone());
    info!(pool_name = %*pool_name, workers = config.worker_count, fail_fast = config.fail_fast, "Job pool created.");
    Ok(Self {
      pool_name,
      state: PoolState {
        worker_count: config.worker_count,
        submitted: Vec::new(),
        completed_count: 0,
      },
      config,
      workers,
      reports,
      collector: ResultCollector::new(),
      detector: FailureDetector::new(),
      lifecycle: Lifecycle::Open,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn worker_count(&self) -> usize {
    self.state.worker_count
  }

  pub fn submitted_count(&self) -> usize {
    self.state.submitted.len()
  }

  pub fn completed_count(&self) -> usize {
    self.state.completed_count
  }

  /// Every submitted job, in submission order.
  pub fn jobs(&self) -> &[JobHandle] {
    &self.state.submitted
  }

  pub fn worker_pool(&self) -> &W {
    &self.workers
  }

  /// Queues a job and returns its submission index. Never waits for the job
  /// to start.
  ///
  /// # Errors
  /// `PoolError::PoolClosed` after `drain` or `close`; any dispatch error of
  /// the worker pool, in which case nothing is recorded.
  pub fn submit(&mut self, invocation: Invocation) -> Result<usize, PoolError> {
    if !matches!(self.lifecycle, Lifecycle::Open) {
      warn!(pool_name = %*self.pool_name, "Submit: pool is closed.");
      return Err(PoolError::PoolClosed);
    }
    let index = self.state.submitted.len();
    debug!(pool_name = %*self.pool_name, index, ?invocation, "Submitting job.");
    self.workers.dispatch(index, invocation.clone())?;

    let reserved = self.collector.reserve();
    debug_assert_eq!(reserved, index);
    self.state.submitted.push(JobHandle::new(index, invocation));
    Ok(index)
  }

  /// Waits until every submitted job has an outcome and returns the values in
  /// submission order.
  ///
  /// `progress_every` overrides the configured progress cadence (0 picks one
  /// automatically). The worker group is terminated before this returns,
  /// whatever the result. Calling it again returns the same result without
  /// running anything.
  ///
  /// # Errors
  /// `PoolError::JobsFailed` listing every failed job; `PoolError::Protocol`
  /// if the worker pool reported a job twice or an unknown job;
  /// `PoolError::Interrupted` on Ctrl-C, with the unfinished jobs cancelled.
  pub async fn drain(&mut self, progress_every: Option<usize>) -> Result<Vec<String>, PoolError> {
    if let Lifecycle::Drained(result) = &self.lifecycle {
      trace!(pool_name = %*self.pool_name, "Drain: already drained, returning cached result.");
      return result.clone();
    }

    let reporter = ProgressReporter::new(
      self.config.progress_sink.clone(),
      progress_every.unwrap_or(self.config.progress_every),
    );
    let waited = self.wait_for_all(&reporter).await;
    self.workers.terminate();

    let result = waited.and_then(|()| self.finish());
    self.lifecycle = Lifecycle::Drained(result.clone());
    result
  }

  /// Kills the workers. Jobs without a result yet resolve as `Cancelled`.
  ///
  /// # Errors
  /// `PoolError::Protocol` if an already-delivered report was inconsistent.
  pub fn close(&mut self) -> Result<(), PoolError> {
    if !matches!(self.lifecycle, Lifecycle::Open) {
      trace!(pool_name = %*self.pool_name, "Close: pool already closed.");
      return Ok(());
    }
    info!(
      pool_name = %*self.pool_name,
      "Closing pool with {} of {} jobs outstanding.",
      self.collector.expected() - self.collector.recorded(),
      self.collector.expected()
    );
    self.workers.terminate();
    self.lifecycle = Lifecycle::Closed;

    while let Ok(report) = self.reports.try_recv() {
      if !self.collector.is_recorded(report.index) {
        self.record_report(report)?;
      }
    }
    self.resolve_outstanding(|detector, index| detector.cancelled(index, "pool closed before the job finished"))
  }

  async fn wait_for_all(&mut self, reporter: &ProgressReporter) -> Result<(), PoolError> {
    let total = self.collector.expected();
    let started = Instant::now();
    let deadline = self.config.drain_timeout.map(|timeout| started + timeout);
    info!(pool_name = %*self.pool_name, total, "Draining job pool.");

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut listening = self.config.handle_interrupts;

    while !self.collector.is_complete() {
      let now = Instant::now();
      if deadline.is_some_and(|deadline| now >= deadline) {
        let elapsed = started.elapsed();
        warn!(pool_name = %*self.pool_name, "Drain deadline exceeded after {:.1}s.", elapsed.as_secs_f64());
        self.workers.terminate();
        self.resolve_outstanding(|detector, index| detector.deadline(index, elapsed))?;
        self.report_progress(reporter, total, started);
        break;
      }
      let wait = deadline.map_or(self.config.poll_interval, |deadline| {
        self.config.poll_interval.min(deadline.saturating_duration_since(now))
      });

      let received = tokio::select! {
        biased;
        interrupted = &mut interrupt, if listening => {
          listening = false;
          match interrupted {
            Ok(()) => {
              warn!(pool_name = %*self.pool_name, "Drain interrupted. Killing workers.");
              self.workers.terminate();
              self.resolve_outstanding(|detector, index| {
                detector.cancelled(index, "interrupted before the job finished")
              })?;
              self.report_progress(reporter, total, started);
              return Err(PoolError::Interrupted);
            }
            Err(e) => {
              warn!(pool_name = %*self.pool_name, "Cannot listen for Ctrl-C: {}", e);
              continue;
            }
          }
        }
        received = tokio::time::timeout(wait, self.reports.recv()) => received,
      };

      match received {
        Ok(Some(report)) => {
          let failed = self.record_report(report)?;
          self.report_progress(reporter, total, started);
          if failed && self.config.fail_fast {
            warn!(pool_name = %*self.pool_name, "Fail-fast: stopping remaining jobs after a failure.");
            self.workers.terminate();
            self.resolve_outstanding(|detector, index| {
              detector.cancelled(index, "cancelled after another job failed (fail-fast)")
            })?;
            self.report_progress(reporter, total, started);
          }
        }
        Ok(None) => {
          warn!(pool_name = %*self.pool_name, "Completion channel closed with jobs outstanding.");
          self.resolve_outstanding(|detector, index| {
            detector.cancelled(index, "worker pool stopped before the job finished")
          })?;
          self.report_progress(reporter, total, started);
        }
        Err(_elapsed) => {
          trace!(
            pool_name = %*self.pool_name,
            "Still waiting: {}/{} jobs done.",
            self.collector.recorded(),
            total
          );
        }
      }
    }

    info!(
      pool_name = %*self.pool_name,
      "Drain finished in {:.1}s.",
      started.elapsed().as_secs_f64()
    );
    Ok(())
  }

  /// Records one worker report. Returns whether the job failed.
  fn record_report(&mut self, report: WorkerReport) -> Result<bool, PoolError> {
    let index = report.index;
    let outcome = self.detector.outcome(report);
    let failed = outcome.is_err();
    self.resolve(index, outcome)?;
    Ok(failed)
  }

  fn resolve(&mut self, index: usize, outcome: Result<String, ClassifiedFailure>) -> Result<(), PoolError> {
    let handle = self.state.submitted.get_mut(index).ok_or_else(|| {
      error!(pool_name = %*self.pool_name, index, "Report for a job that was never submitted.");
      PoolError::Protocol(format!("report for unknown job index {index}"))
    })?;
    if let Err(e) = handle.resolve(JobOutcome::from(outcome.clone())) {
      error!(pool_name = %*self.pool_name, index, "Job reported twice.");
      return Err(e);
    }
    self.collector.record(index, outcome)?;
    self.state.completed_count += 1;
    trace!(pool_name = %*self.pool_name, index, completed = self.state.completed_count, "Job resolved.");
    Ok(())
  }

  fn resolve_outstanding(
    &mut self,
    classify: impl Fn(&FailureDetector, usize) -> ClassifiedFailure,
  ) -> Result<(), PoolError> {
    let outstanding: Vec<usize> = self.collector.missing().collect();
    for index in outstanding {
      let failure = classify(&self.detector, index);
      self.resolve(index, Err(failure))?;
    }
    Ok(())
  }

  fn report_progress(&self, reporter: &ProgressReporter, total: usize, started: Instant) {
    let completed = self.state.completed_count;
    if reporter.should_report(completed, total) {
      reporter.report(completed, total, started.elapsed());
    }
  }

  fn finish(&self) -> Result<Vec<String>, PoolError> {
    let outcomes = self.collector.finalize()?;
    if outcomes.iter().all(Result::is_ok) {
      info!(pool_name = %*self.pool_name, jobs = outcomes.len(), "All jobs completed successfully.");
      return Ok(outcomes.into_iter().flatten().collect());
    }
    let aggregate = AggregateFailure::from_outcomes(outcomes);
    warn!(
      pool_name = %*self.pool_name,
      failed = aggregate.failures().len(),
      total = aggregate.total_jobs(),
      "Drain finished with failed jobs."
    );
    Err(PoolError::JobsFailed(aggregate))
  }
}

impl<W: WorkerPool> Drop for JobPool<W> {
  fn drop(&mut self) {
    if matches!(self.lifecycle, Lifecycle::Open) {
      debug!(pool_name = %*self.pool_name, "JobPool dropped while open. Terminating workers.");
    }
    self.workers.terminate();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::failure::FailureKind;
  use crate::memory::MemoryTrace;
  use crate::progress::ProgressSink;
  use crate::worker::WorkerExit;

  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration;

  use parking_lot::Mutex;

  #[derive(Clone, Default)]
  struct ScriptedWorkers {
    dispatched: Arc<Mutex<Vec<usize>>>,
    terminated: Arc<AtomicBool>,
  }

  impl WorkerPool for ScriptedWorkers {
    fn dispatch(&self, index: usize, _invocation: Invocation) -> Result<(), PoolError> {
      self.dispatched.lock().push(index);
      Ok(())
    }

    fn terminate(&self) {
      self.terminated.store(true, Ordering::SeqCst);
    }
  }

  fn scripted_pool(
    config: PoolConfig,
  ) -> (JobPool<ScriptedWorkers>, ScriptedWorkers, mpsc::UnboundedSender<WorkerReport>) {
    let workers = ScriptedWorkers::default();
    let (tx, rx) = mpsc::unbounded_channel();
    let config = config
      .with_poll_interval(Duration::from_millis(10))
      .with_progress_sink(ProgressSink::Silent);
    let pool = JobPool::from_parts(config, workers.clone(), rx).unwrap();
    (pool, workers, tx)
  }

  fn report(index: usize, exit: WorkerExit) -> WorkerReport {
    WorkerReport {
      index,
      exit,
      stderr: String::new(),
      memory: MemoryTrace::default(),
    }
  }

  fn returned(index: usize, value: &str) -> WorkerReport {
    report(index, WorkerExit::Returned(value.to_string()))
  }

  fn submit_n(pool: &mut JobPool<ScriptedWorkers>, n: usize) {
    for i in 0..n {
      assert_eq!(pool.submit(Invocation::new("job").arg(i.to_string())).unwrap(), i);
    }
  }

  #[test]
  fn zero_workers_is_a_configuration_error() {
    let (_tx, rx) = mpsc::unbounded_channel();
    let result = JobPool::from_parts(PoolConfig::new(0), ScriptedWorkers::default(), rx);
    assert!(matches!(result, Err(PoolError::Configuration(_))));
  }

  #[test]
  fn new_outside_a_runtime_is_a_configuration_error() {
    assert!(matches!(JobPool::new(2), Err(PoolError::Configuration(_))));
  }

  #[tokio::test]
  async fn results_follow_submission_order_not_completion_order() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(3));
    submit_n(&mut pool, 5);
    assert_eq!(*workers.dispatched.lock(), vec![0, 1, 2, 3, 4]);

    for index in [4, 2, 0, 3, 1] {
      tx.send(returned(index, &format!("v{index}"))).unwrap();
    }

    let results = pool.drain(Some(1)).await.unwrap();
    assert_eq!(results, vec!["v0", "v1", "v2", "v3", "v4"]);
    assert_eq!(pool.completed_count(), 5);
    assert!(pool.jobs().iter().all(JobHandle::is_terminal));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn failures_are_collected_without_stopping_siblings() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(2));
    submit_n(&mut pool, 3);

    tx.send(returned(0, "a")).unwrap();
    tx.send(report(
      1,
      WorkerExit::Raised {
        code: Some(1),
        message: "boom".into(),
      },
    ))
    .unwrap();
    tx.send(returned(2, "c")).unwrap();

    let err = pool.drain(None).await.unwrap_err();
    let PoolError::JobsFailed(aggregate) = err else {
      panic!("expected JobsFailed, got {err:?}");
    };
    assert_eq!(aggregate.failures().len(), 1);
    assert_eq!(aggregate.failures()[0].index(), 1);
    assert_eq!(aggregate.failures()[0].kind(), FailureKind::ApplicationException);
    assert_eq!(aggregate.outcomes()[0], Ok("a".to_string()));
    assert_eq!(aggregate.outcomes()[2], Ok("c".to_string()));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn fail_fast_cancels_outstanding_jobs() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(2).with_fail_fast(true));
    submit_n(&mut pool, 4);

    tx.send(returned(1, "b")).unwrap();
    tx.send(report(0, WorkerExit::Signalled { signal: 11 })).unwrap();

    let PoolError::JobsFailed(aggregate) = pool.drain(None).await.unwrap_err() else {
      panic!("expected JobsFailed");
    };
    let kinds: Vec<FailureKind> = aggregate.failures().iter().map(ClassifiedFailure::kind).collect();
    assert_eq!(
      kinds,
      vec![FailureKind::Signalled, FailureKind::Cancelled, FailureKind::Cancelled]
    );
    assert_eq!(aggregate.outcomes()[1], Ok("b".to_string()));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn duplicate_report_is_a_protocol_error() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(1));
    submit_n(&mut pool, 2);

    tx.send(returned(0, "first")).unwrap();
    tx.send(returned(0, "again")).unwrap();

    assert!(matches!(pool.drain(None).await, Err(PoolError::Protocol(_))));
    assert_eq!(pool.jobs()[0].outcome(), &JobOutcome::Succeeded("first".into()));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn report_for_unknown_job_is_a_protocol_error() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(1));
    submit_n(&mut pool, 1);
    tx.send(returned(9, "stray")).unwrap();

    assert!(matches!(pool.drain(None).await, Err(PoolError::Protocol(_))));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn drain_deadline_times_out_outstanding_jobs() {
    let (mut pool, workers, tx) =
      scripted_pool(PoolConfig::new(2).with_drain_timeout(Some(Duration::from_millis(100))));
    submit_n(&mut pool, 3);
    tx.send(returned(1, "done")).unwrap();

    let PoolError::JobsFailed(aggregate) = pool.drain(None).await.unwrap_err() else {
      panic!("expected JobsFailed");
    };
    let timed_out: Vec<usize> = aggregate
      .failures()
      .iter()
      .filter(|f| f.kind() == FailureKind::Timeout)
      .map(ClassifiedFailure::index)
      .collect();
    assert_eq!(timed_out, vec![0, 2]);
    assert!(workers.terminated.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn closed_channel_cancels_outstanding_jobs() {
    let (mut pool, _workers, tx) = scripted_pool(PoolConfig::new(2));
    submit_n(&mut pool, 2);
    tx.send(returned(0, "ok")).unwrap();
    drop(tx);

    let PoolError::JobsFailed(aggregate) = pool.drain(None).await.unwrap_err() else {
      panic!("expected JobsFailed");
    };
    assert_eq!(aggregate.failures().len(), 1);
    assert_eq!(aggregate.failures()[0].kind(), FailureKind::Cancelled);
    assert_eq!(aggregate.failures()[0].index(), 1);
  }

  #[tokio::test]
  async fn close_resolves_outstanding_jobs_as_cancelled() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(2));
    submit_n(&mut pool, 3);
    tx.send(returned(2, "already here")).unwrap();

    pool.close().unwrap();
    assert!(workers.terminated.load(Ordering::SeqCst));
    assert_eq!(pool.submit(Invocation::new("late")), Err(PoolError::PoolClosed));
    assert_eq!(pool.completed_count(), 3);

    let PoolError::JobsFailed(aggregate) = pool.drain(None).await.unwrap_err() else {
      panic!("expected JobsFailed");
    };
    assert_eq!(aggregate.outcomes()[2], Ok("already here".to_string()));
    let cancelled: Vec<usize> = aggregate.failures().iter().map(ClassifiedFailure::index).collect();
    assert_eq!(cancelled, vec![0, 1]);
  }

  #[tokio::test]
  async fn second_drain_returns_cached_result_without_dispatching() {
    let (mut pool, workers, tx) = scripted_pool(PoolConfig::new(2));
    submit_n(&mut pool, 2);
    tx.send(returned(1, "y")).unwrap();
    tx.send(returned(0, "x")).unwrap();

    let first = pool.drain(None).await;
    let second = pool.drain(None).await;
    assert_eq!(first, Ok(vec!["x".to_string(), "y".to_string()]));
    assert_eq!(first, second);
    assert_eq!(workers.dispatched.lock().len(), 2);
    assert_eq!(pool.submit(Invocation::new("late")), Err(PoolError::PoolClosed));
  }

  #[tokio::test]
  async fn drain_with_no_jobs_returns_empty() {
    let (mut pool, workers, _tx) = scripted_pool(PoolConfig::new(1));
    assert_eq!(pool.drain(None).await, Ok(Vec::new()));
    assert!(workers.terminated.load(Ordering::SeqCst));
  }
}
