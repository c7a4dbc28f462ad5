use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::invocation::{default_threads_per_job, Invocation, THREAD_LIMIT_VARS};
use crate::memory::{self, MemorySize, MemoryTrace};

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// How long to wait for a finished worker's output pipes to close.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on the stderr text carried in a report.
const STDERR_TAIL_BYTES: usize = 4096;

/// How a worker process ended, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
  /// Exit status 0; carries stdout minus the trailing newline.
  Returned(String),
  /// The job reported an error: a non-zero exit code (`code` is set), or the
  /// program could not be launched (`code` is `None`).
  Raised { code: Option<i32>, message: String },
  /// Terminated by a signal.
  Signalled { signal: i32 },
  /// Killed after running past the per-job deadline.
  DeadlineExceeded(Duration),
  /// Killed because the worker pool was terminated.
  Cancelled,
  /// Anything that could not be interpreted.
  Unknown(String),
}

/// What the worker pool sends back for every dispatched job.
#[derive(Debug, Clone)]
pub struct WorkerReport {
  pub index: usize,
  pub exit: WorkerExit,
  /// Tail of the captured stderr.
  pub stderr: String,
  pub memory: MemoryTrace,
}

/// The process-pool surface a [`JobPool`](crate::JobPool) drives.
///
/// Implementations run jobs on a bounded set of workers and deliver one
/// [`WorkerReport`] per dispatched job on the completion channel handed to
/// the `JobPool` next to them.
pub trait WorkerPool: Send {
  /// Queues a job. Must not block.
  fn dispatch(&self, index: usize, invocation: Invocation) -> Result<(), PoolError>;

  /// Stops accepting work and kills every running worker.
  fn terminate(&self);
}

/// Knobs the process pool needs, derived from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub worker_count: usize,
  pub job_timeout: Option<Duration>,
  pub memory_limit: Option<MemorySize>,
  pub memory_sample_interval: Duration,
  pub threads_per_job: usize,
  /// Kill every worker group on Ctrl-C.
  pub handle_interrupts: bool,
}

impl WorkerSettings {
  pub fn from_config(config: &PoolConfig) -> Self {
    Self {
      worker_count: config.worker_count,
      job_timeout: config.job_timeout,
      memory_limit: config.memory_limit,
      memory_sample_interval: config.memory_sample_interval,
      threads_per_job: config
        .threads_per_job
        .unwrap_or_else(|| default_threads_per_job(config.worker_count)),
      handle_interrupts: config.handle_interrupts,
    }
  }
}

struct QueuedJob {
  index: usize,
  invocation: Invocation,
}

#[derive(Debug)]
struct ActiveJob {
  token: CancellationToken,
  pid: Option<u32>,
}

/// Runs every job as its own OS process, at most `worker_count` at a time.
///
/// Each child gets its own process group, a thread budget for numeric
/// libraries, and a resident-memory watchdog. Kills always target the whole
/// process group.
pub struct ProcessWorkerPool {
  pool_name: Arc<String>,
  queue_tx: mpsc::UnboundedSender<QueuedJob>,
  active_jobs: Arc<DashMap<usize, ActiveJob>>,
  shutdown_token: CancellationToken,
  dispatch_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProcessWorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProcessWorkerPool")
      .field("pool_name", &self.pool_name)
      .field("active_jobs", &self.active_jobs.len())
      .field("terminated", &self.shutdown_token.is_cancelled())
      .finish()
  }
}

impl ProcessWorkerPool {
  /// Starts the dispatch loop and returns the pool with its completion channel.
  pub fn spawn(
    settings: WorkerSettings,
    tokio_handle: TokioHandle,
    pool_name: &str,
  ) -> (Self, mpsc::UnboundedReceiver<WorkerReport>) {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();
    let active_jobs = Arc::new(DashMap::new());
    let pool_name = Arc::new(pool_name.to_string());

    info!(
      pool_name = %*pool_name,
      workers = settings.worker_count,
      threads_per_job = settings.threads_per_job,
      memory_limit = ?settings.memory_limit,
      "Starting worker process pool."
    );

    if settings.handle_interrupts {
      tokio_handle.spawn(
        watch_for_interrupt(pool_name.clone(), active_jobs.clone(), shutdown_token.clone())
          .instrument(info_span!("worker_interrupt_watch", pool_name = %*pool_name)),
      );
    }

    let dispatch_loop = tokio_handle.spawn(
      Self::run_dispatch_loop(
        pool_name.clone(),
        Arc::new(settings),
        queue_rx,
        reports_tx,
        tokio_handle.clone(),
        active_jobs.clone(),
        shutdown_token.clone(),
      )
      .instrument(info_span!("worker_dispatch_loop", pool_name = %*pool_name)),
    );

    let pool = Self {
      pool_name,
      queue_tx,
      active_jobs,
      shutdown_token,
      dispatch_loop_handle: Mutex::new(Some(dispatch_loop)),
    };
    (pool, reports_rx)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of jobs whose worker process is currently running.
  pub fn active_job_count(&self) -> usize {
    self.active_jobs.len()
  }

  pub fn is_terminated(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  async fn run_dispatch_loop(
    pool_name: Arc<String>,
    settings: Arc<WorkerSettings>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedJob>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    tokio_handle: TokioHandle,
    active_jobs: Arc<DashMap<usize, ActiveJob>>,
    shutdown_token: CancellationToken,
  ) {
    info!(name = %*pool_name, "Dispatch loop started.");
    let semaphore = Arc::new(Semaphore::new(settings.worker_count.max(1)));

    loop {
      let permit = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Termination requested. Dispatch loop stopping.");
          break;
        }
        acquired = semaphore.clone().acquire_owned() => match acquired {
          Ok(permit) => permit,
          Err(_) => {
            error!(name = %*pool_name, "Worker semaphore closed. Dispatch loop exiting.");
            break;
          }
        }
      };
      trace!(name = %*pool_name, "Acquired worker slot. Available: {}", semaphore.available_permits());

      let job = tokio::select! {
        biased;
        _ = shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Termination requested while waiting for a job. Releasing slot.");
          break;
        }
        received = queue_rx.recv() => match received {
          Some(job) => job,
          None => {
            info!(name = %*pool_name, "Job queue closed and empty. Dispatch loop stopping.");
            break;
          }
        }
      };

      let index = job.index;
      let job_token = shutdown_token.child_token();
      active_jobs.insert(
        index,
        ActiveJob {
          token: job_token.clone(),
          pid: None,
        },
      );
      debug!(name = %*pool_name, index, program = ?job.invocation.program(), "Dequeued job. Starting worker process.");

      let job_settings = settings.clone();
      let job_active_jobs = active_jobs.clone();
      let job_reports_tx = reports_tx.clone();
      let cleanup_active_jobs = active_jobs.clone();
      let pool_name_for_job = pool_name.clone();
      let pool_name_for_cleanup = pool_name.clone();

      tokio_handle.spawn(
        async move {
          let _slot = permit;
          let report = run_job(job, &job_settings, &job_token, &job_active_jobs).await;
          if job_reports_tx.send(report).is_err() {
            warn!(pool_name = %*pool_name_for_job, index, "Report receiver dropped. Job outcome lost.");
          }
        }
        .instrument(info_span!("worker_job", pool_name = %*pool_name, index))
        .then(move |()| {
          cleanup_active_jobs.remove(&index);
          trace!(name = %*pool_name_for_cleanup, index, "Worker finished, removed active entry.");
          async {}
        }),
      );
    }

    info!(
      name = %*pool_name,
      "Dispatch loop stopped. Workers still running: {}",
      active_jobs.len()
    );
  }
}

impl WorkerPool for ProcessWorkerPool {
  fn dispatch(&self, index: usize, invocation: Invocation) -> Result<(), PoolError> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.pool_name, index, "Dispatch: worker pool already terminated.");
      return Err(PoolError::PoolClosed);
    }
    trace!(pool_name = %self.pool_name, index, "Queueing job.");
    self
      .queue_tx
      .send(QueuedJob { index, invocation })
      .map_err(|_| PoolError::DispatchFailed {
        index,
        reason: "dispatch loop is no longer running".to_string(),
      })
  }

  fn terminate(&self) {
    if self.shutdown_token.is_cancelled() {
      trace!(pool_name = %self.pool_name, "Terminate: already terminated.");
      return;
    }
    info!(
      pool_name = %self.pool_name,
      "Terminating worker pool. Killing {} running workers.",
      self.active_jobs.len()
    );
    self.shutdown_token.cancel();
    kill_active_jobs(&self.pool_name, &self.active_jobs);
    if let Some(handle) = self.dispatch_loop_handle.lock().take() {
      handle.abort();
    }
  }
}

impl Drop for ProcessWorkerPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "ProcessWorkerPool dropped. Terminating workers."
      );
      self.terminate();
    }
  }
}

fn kill_active_jobs(pool_name: &str, active_jobs: &DashMap<usize, ActiveJob>) {
  for entry in active_jobs.iter() {
    let (index, active) = entry.pair();
    active.token.cancel();
    if let Some(pid) = active.pid {
      debug!(pool_name, index, pid, "Killing worker process group.");
      kill_process_group(pid);
    }
  }
}

/// Workers live in their own process groups, so a terminal Ctrl-C only
/// reaches this process. Tear them down here instead.
async fn watch_for_interrupt(
  pool_name: Arc<String>,
  active_jobs: Arc<DashMap<usize, ActiveJob>>,
  shutdown_token: CancellationToken,
) {
  tokio::select! {
    _ = shutdown_token.cancelled() => {
      trace!(pool_name = %*pool_name, "Pool terminated. Interrupt watch ending.");
    }
    interrupt = tokio::signal::ctrl_c() => match interrupt {
      Ok(()) => {
        warn!(
          pool_name = %*pool_name,
          "Interrupted. Killing {} running workers.",
          active_jobs.len()
        );
        shutdown_token.cancel();
        kill_active_jobs(&pool_name, &active_jobs);
      }
      Err(e) => warn!(pool_name = %*pool_name, "Cannot listen for Ctrl-C: {}", e),
    }
  }
}

enum Stop {
  Exited(ExitStatus),
  WaitFailed(std::io::Error),
  Cancelled,
  DeadlineExceeded(Duration),
  MemoryExceeded,
}

async fn run_job(
  job: QueuedJob,
  settings: &WorkerSettings,
  token: &CancellationToken,
  active_jobs: &DashMap<usize, ActiveJob>,
) -> WorkerReport {
  let QueuedJob { index, invocation } = job;
  let mut memory = MemoryTrace::new(settings.memory_limit);
  if token.is_cancelled() {
    return WorkerReport {
      index,
      exit: WorkerExit::Cancelled,
      stderr: String::new(),
      memory,
    };
  }

  let mut command = Command::new(invocation.program());
  command.args(invocation.arguments());
  let threads = settings.threads_per_job.to_string();
  for var in THREAD_LIMIT_VARS {
    command.env(var, &threads);
  }
  command
    .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .process_group(0)
    .kill_on_drop(true);

  let mut child = match command.spawn() {
    Ok(child) => child,
    Err(e) => {
      warn!(index, program = ?invocation.program(), "Failed to launch worker process: {}", e);
      return WorkerReport {
        index,
        exit: WorkerExit::Raised {
          code: None,
          message: format!("failed to launch {}: {e}", invocation.program().to_string_lossy()),
        },
        stderr: String::new(),
        memory,
      };
    }
  };

  let pid = child.id();
  if let Some(mut active) = active_jobs.get_mut(&index) {
    active.pid = pid;
  }
  debug!(index, pid, "Worker process started.");

  let stdout_reader = child.stdout.take().map(|pipe| tokio::spawn(read_to_end(pipe)));
  let stderr_reader = child.stderr.take().map(|pipe| tokio::spawn(read_to_end(pipe)));

  let started = Instant::now();
  let deadline = settings.job_timeout.map(|timeout| started + timeout);
  let mut sampler = tokio::time::interval(settings.memory_sample_interval);
  sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

  let stop = loop {
    tokio::select! {
      biased;
      _ = token.cancelled() => break Stop::Cancelled,
      _ = sleep_until(deadline) => break Stop::DeadlineExceeded(started.elapsed()),
      status = child.wait() => break match status {
        Ok(status) => Stop::Exited(status),
        Err(e) => Stop::WaitFailed(e),
      },
      _ = sampler.tick() => {
        // The whole group counts, so helpers the job forks stay under the cap.
        if let Some(usage) = pid.and_then(memory::group_usage) {
          let rss = usage.resident_bytes;
          if memory.record(rss) {
            warn!(
              index,
              pid,
              rss_bytes = rss,
              processes = usage.members,
              limit = ?settings.memory_limit,
              "Worker group exceeded its memory limit. Killing it."
            );
            break Stop::MemoryExceeded;
          }
        }
      }
    }
  };

  let exit = match stop {
    Stop::Exited(status) => {
      // Leftover members of the group would keep the output pipes open. The
      // leader is already reaped, but its pid stays reserved while any member
      // still uses it as a pgid. An empty group is left alone, since the number
      // may have been handed to an unrelated process by now.
      if let Some(pid) = pid {
        if group_has_members(pid) {
          kill_process_group(pid);
        }
      }
      let stdout = collect_output(stdout_reader).await;
      return finish(index, exit_from_status(status, stdout), stderr_reader, memory).await;
    }
    Stop::WaitFailed(e) => {
      stop_child(pid, &mut child).await;
      WorkerExit::Unknown(format!("waiting for worker failed: {e}"))
    }
    Stop::Cancelled => {
      debug!(index, pid, "Job cancelled by pool termination.");
      stop_child(pid, &mut child).await;
      WorkerExit::Cancelled
    }
    Stop::DeadlineExceeded(after) => {
      warn!(index, pid, "Job exceeded its deadline after {:.1}s. Killing it.", after.as_secs_f64());
      stop_child(pid, &mut child).await;
      WorkerExit::DeadlineExceeded(after)
    }
    Stop::MemoryExceeded => {
      memory.mark_reaped();
      let signal = stop_child(pid, &mut child)
        .await
        .and_then(|status| status.signal())
        .unwrap_or(Signal::SIGKILL as i32);
      WorkerExit::Signalled { signal }
    }
  };

  if let Some(reader) = stdout_reader {
    reader.abort();
  }
  finish(index, exit, stderr_reader, memory).await
}

async fn finish(
  index: usize,
  exit: WorkerExit,
  stderr_reader: Option<JoinHandle<Vec<u8>>>,
  memory: MemoryTrace,
) -> WorkerReport {
  let stderr = tail(&collect_output(stderr_reader).await);
  if !stderr.is_empty() {
    debug!(index, "Worker stderr: {}", stderr);
  }
  trace!(index, exit = ?exit, "Worker report ready.");
  WorkerReport {
    index,
    exit,
    stderr,
    memory,
  }
}

fn exit_from_status(status: ExitStatus, stdout: String) -> WorkerExit {
  if let Some(signal) = status.signal() {
    return WorkerExit::Signalled { signal };
  }
  match status.code() {
    Some(0) => WorkerExit::Returned(strip_trailing_newline(stdout)),
    Some(code) => WorkerExit::Raised {
      code: Some(code),
      message: String::new(),
    },
    None => WorkerExit::Unknown(format!("unrecognised exit status {status}")),
  }
}

async fn sleep_until(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

/// SIGKILLs the child's process group and reaps the leader.
async fn stop_child(pid: Option<u32>, child: &mut Child) -> Option<ExitStatus> {
  match pid {
    Some(pid) if kill_process_group(pid) => {}
    _ => {
      if let Err(e) = child.start_kill() {
        trace!(pid, "start_kill failed: {}", e);
      }
    }
  }
  child.wait().await.ok()
}

/// Without `/proc` membership cannot be checked, so the group is assumed live.
fn group_has_members(pgid: u32) -> bool {
  memory::group_usage(pgid).map_or(true, |usage| usage.members > 0)
}

/// Returns `false` if the group could not be signalled.
fn kill_process_group(pid: u32) -> bool {
  let Ok(raw) = i32::try_from(pid) else {
    return false;
  };
  match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
    Ok(()) => true,
    Err(errno) => {
      trace!(pid, %errno, "killpg failed.");
      false
    }
  }
}

async fn read_to_end<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
  let mut buf = Vec::new();
  if let Err(e) = pipe.read_to_end(&mut buf).await {
    trace!("Reading worker output failed: {}", e);
  }
  buf
}

async fn collect_output(reader: Option<JoinHandle<Vec<u8>>>) -> String {
  let Some(reader) = reader else {
    return String::new();
  };
  let abort = reader.abort_handle();
  match tokio::time::timeout(OUTPUT_GRACE, reader).await {
    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
    Ok(Err(join_error)) => {
      trace!("Output reader failed: {:?}", join_error);
      String::new()
    }
    Err(_) => {
      abort.abort();
      String::new()
    }
  }
}

fn strip_trailing_newline(mut text: String) -> String {
  if text.ends_with('\n') {
    text.pop();
    if text.ends_with('\r') {
      text.pop();
    }
  }
  text
}

fn tail(text: &str) -> String {
  let text = text.trim_end();
  if text.len() <= STDERR_TAIL_BYTES {
    return text.to_string();
  }
  let mut start = text.len() - STDERR_TAIL_BYTES;
  while !text.is_char_boundary(start) {
    start += 1;
  }
  format!("...{}", &text[start..])
}
