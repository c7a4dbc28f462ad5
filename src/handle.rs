use crate::error::PoolError;
use crate::failure::ClassifiedFailure;
use crate::invocation::Invocation;

/// State of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
  Pending,
  Succeeded(String),
  Failed(ClassifiedFailure),
}

impl JobOutcome {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, Self::Pending)
  }

  /// The terminal outcome as a `Result`, or `None` while pending.
  pub fn as_result(&self) -> Option<Result<String, ClassifiedFailure>> {
    match self {
      Self::Pending => None,
      Self::Succeeded(value) => Some(Ok(value.clone())),
      Self::Failed(failure) => Some(Err(failure.clone())),
    }
  }
}

impl From<Result<String, ClassifiedFailure>> for JobOutcome {
  fn from(result: Result<String, ClassifiedFailure>) -> Self {
    match result {
      Ok(value) => Self::Succeeded(value),
      Err(failure) => Self::Failed(failure),
    }
  }
}

/// One job submitted to a [`JobPool`](crate::JobPool).
///
/// Created pending at submission and resolved exactly once when its report
/// comes back from the worker pool.
#[derive(Debug, Clone)]
pub struct JobHandle {
  pub(crate) index: usize,
  pub(crate) invocation: Invocation,
  pub(crate) outcome: JobOutcome,
}

impl JobHandle {
  pub(crate) fn new(index: usize, invocation: Invocation) -> Self {
    Self {
      index,
      invocation,
      outcome: JobOutcome::Pending,
    }
  }

  /// Submission index of this job.
  pub fn index(&self) -> usize {
    self.index
  }

  /// The invocation as it was submitted.
  pub fn invocation(&self) -> &Invocation {
    &self.invocation
  }

  pub fn outcome(&self) -> &JobOutcome {
    &self.outcome
  }

  pub fn is_terminal(&self) -> bool {
    self.outcome.is_terminal()
  }

  /// Moves the job from pending to a terminal outcome.
  ///
  /// # Errors
  /// `PoolError::Protocol` if the job was already resolved.
  pub(crate) fn resolve(&mut self, outcome: JobOutcome) -> Result<(), PoolError> {
    if self.outcome.is_terminal() {
      return Err(PoolError::Protocol(format!("job {} resolved twice", self.index)));
    }
    self.outcome = outcome;
    Ok(())
  }
}
