//! A Tokio-driven pool of worker processes: submit jobs, drain them, and get
//! results back in submission order with worker crashes (signals, OOM kills,
//! deadlines) classified per job.

mod collector;
mod config;
mod error;
mod failure;
mod handle;
mod invocation;
mod memory;
mod pool;
mod progress;
mod worker;

pub use collector::ResultCollector;
pub use config::{PoolConfig, DEFAULT_JOB_TIMEOUT};
pub use error::{AggregateFailure, PoolError};
pub use failure::{ClassifiedFailure, FailureDetector, FailureKind};
pub use handle::{JobHandle, JobOutcome};
pub use invocation::{Invocation, THREAD_LIMIT_VARS};
pub use memory::{MemorySize, MemoryTrace};
pub use pool::JobPool;
pub use progress::{ProgressReporter, ProgressSink};
pub use worker::{ProcessWorkerPool, WorkerExit, WorkerPool, WorkerReport, WorkerSettings};
