use crate::failure::ClassifiedFailure;

use std::fmt;

use thiserror::Error;

/// Errors that can occur within the `job_pool` crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  Configuration(String),

  #[error("Internal consistency violation (bug in the orchestrator): {0}")]
  Protocol(String),

  #[error("Results requested early: {recorded} of {expected} jobs recorded")]
  Incomplete { recorded: usize, expected: usize },

  #[error("Pool is closed or already drained, cannot accept new jobs")]
  PoolClosed,

  #[error("Failed to dispatch job {index} to the worker pool: {reason}")]
  DispatchFailed { index: usize, reason: String },

  #[error("Drain interrupted by Ctrl-C, outstanding jobs were cancelled")]
  Interrupted,

  #[error("{0}")]
  JobsFailed(AggregateFailure),
}

/// Every classified failure of one drain, together with the full ordered
/// outcome list so callers can still use the jobs that succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFailure {
  failures: Vec<ClassifiedFailure>,
  outcomes: Vec<Result<String, ClassifiedFailure>>,
}

impl AggregateFailure {
  pub(crate) fn from_outcomes(outcomes: Vec<Result<String, ClassifiedFailure>>) -> Self {
    let failures = outcomes
      .iter()
      .filter_map(|outcome| outcome.as_ref().err().cloned())
      .collect();
    Self { failures, outcomes }
  }

  /// The failed jobs, ordered by submission index.
  pub fn failures(&self) -> &[ClassifiedFailure] {
    &self.failures
  }

  /// One entry per submitted job, ordered by submission index.
  pub fn outcomes(&self) -> &[Result<String, ClassifiedFailure>] {
    &self.outcomes
  }

  pub fn total_jobs(&self) -> usize {
    self.outcomes.len()
  }
}

impl fmt::Display for AggregateFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} of {} jobs failed", self.failures.len(), self.outcomes.len())?;
    for failure in &self.failures {
      write!(f, "\n  {failure}")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::failure::FailureKind;

  #[test]
  fn aggregate_lists_every_failure_in_index_order() {
    let outcomes = vec![
      Ok("1".to_string()),
      Err(ClassifiedFailure::new(FailureKind::ApplicationException, 1, "boom")),
      Ok("3".to_string()),
      Err(ClassifiedFailure::new(FailureKind::Timeout, 3, "deadline of 2s exceeded")),
    ];
    let aggregate = AggregateFailure::from_outcomes(outcomes);

    assert_eq!(aggregate.total_jobs(), 4);
    let indices: Vec<usize> = aggregate.failures().iter().map(ClassifiedFailure::index).collect();
    assert_eq!(indices, vec![1, 3]);

    let text = PoolError::JobsFailed(aggregate).to_string();
    assert!(text.starts_with("2 of 4 jobs failed"));
    assert!(text.contains("job 1"));
    assert!(text.contains("boom"));
    assert!(text.contains("job 3"));
  }
}
