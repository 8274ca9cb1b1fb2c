//! Background task orchestration: definitions, run bookkeeping, scheduling,
//! and execution with retry and backoff.
//!
//! ## Components
//!
//! - `TaskDefinition` / `TaskRun`: static job configuration and one firing of it
//! - `TaskRunStore`: run persistence, claiming, cancellation, pruning
//! - `TaskScheduler`: decides what is due and submits it
//! - `TaskExecutor`: runs handlers on a worker pool, or inline when degraded

pub mod executor;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorConfig, ExecutorError, ExecutorStats, JobContext, TaskExecutor, TaskExecutorBuilder,
    TaskHandler,
};
pub use runner::{ExecutionMode, Submission, TaskRunner};
pub use scheduler::{
    SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerLoop, TaskRegistry, TaskScheduler,
    TickReport, due_tasks,
};
pub use store::{
    CancelOutcome, InMemoryTaskRunStore, TaskRunFilter, TaskRunStats, TaskRunStore,
    TaskRunStoreError,
};
pub use types::{
    AttemptRecord, BackoffStrategy, CancellationToken, IdempotencyClass, JobResult, RetryPolicy,
    ScheduleBasis, TaskDefinition, TaskExecutionError, TaskRun, TaskRunId, TaskRunState,
};
