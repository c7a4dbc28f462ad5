use std::ffi::{OsStr, OsString};
use std::fmt;

/// The environment variables read by the common numeric/BLAS thread pools.
/// Each worker process gets all of them set to its thread budget.
pub const THREAD_LIMIT_VARS: [&str; 6] = [
  "OMP_NUM_THREADS",
  "OPENBLAS_NUM_THREADS",
  "MKL_NUM_THREADS",
  "VECLIB_MAXIMUM_THREADS",
  "NUMEXPR_NUM_THREADS",
  "RAYON_NUM_THREADS",
];

/// One unit of work: the program to run (the callable reference) plus its
/// argument bundle.
///
/// Positional arguments become the process argv, keyword arguments become
/// environment variables of the worker process. Nothing is validated here;
/// the worker pool finds out whether the program can be launched at dispatch
/// time.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
  program: OsString,
  args: Vec<OsString>,
  env: Vec<(OsString, OsString)>,
}

impl Invocation {
  pub fn new(program: impl AsRef<OsStr>) -> Self {
    Self {
      program: program.as_ref().to_os_string(),
      args: Vec::new(),
      env: Vec::new(),
    }
  }

  /// Convenience for `sh -c <script>`.
  pub fn shell(script: impl AsRef<OsStr>) -> Self {
    Self::new("/bin/sh").arg("-c").arg(script)
  }

  #[must_use]
  pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
    self.args.push(arg.as_ref().to_os_string());
    self
  }

  #[must_use]
  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
  {
    self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
    self
  }

  #[must_use]
  pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
    self.env.push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
    self
  }

  pub fn program(&self) -> &OsStr {
    &self.program
  }

  pub fn arguments(&self) -> &[OsString] {
    &self.args
  }

  pub fn environment(&self) -> &[(OsString, OsString)] {
    &self.env
  }
}

impl fmt::Debug for Invocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Invocation")
      .field("program", &self.program)
      .field("args", &self.args)
      .field("env_count", &self.env.len())
      .finish()
  }
}

/// Per-process thread budget so that `worker_count` processes running
/// threaded numeric code do not oversubscribe the machine.
pub(crate) fn default_threads_per_job(worker_count: usize) -> usize {
  let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
  (cpus / worker_count.max(1)).max(1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_collects_args_and_env_in_order() {
    let invocation = Invocation::new("/usr/bin/env")
      .arg("-0")
      .args(["a", "b"])
      .env("K1", "v1")
      .env("K2", "v2");

    assert_eq!(invocation.program(), OsStr::new("/usr/bin/env"));
    assert_eq!(invocation.arguments(), &["-0", "a", "b"].map(OsString::from));
    assert_eq!(invocation.environment().len(), 2);
    assert_eq!(invocation.environment()[1].0, OsString::from("K2"));
  }

  #[test]
  fn shell_wraps_script() {
    let invocation = Invocation::shell("echo hi");
    assert_eq!(invocation.program(), OsStr::new("/bin/sh"));
    assert_eq!(invocation.arguments(), &["-c", "echo hi"].map(OsString::from));
  }

  #[test]
  fn thread_budget_is_never_zero() {
    assert!(default_threads_per_job(1) >= 1);
    assert_eq!(default_threads_per_job(usize::MAX), 1);
  }
}
