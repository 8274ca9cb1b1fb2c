//! Task executor: handler registry, retry bookkeeping, runner selection.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::broker::BrokerProbe;

use super::runner::{AsyncRunner, ExecutionMode, InlineRunner, Submission, TaskRunner};
use super::store::{CancelOutcome, TaskRunStore, TaskRunStoreError};
use super::types::{
    CancellationToken, JobResult, TaskExecutionError, TaskRun, TaskRunId, TaskRunState,
};

/// Task body signature.
pub type TaskHandler = Arc<dyn Fn(&JobContext) -> JobResult + Send + Sync>;

/// What a task body gets to see about the run executing it.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: TaskRunId,
    pub task_name: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub payload: JsonValue,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(run: &TaskRun, started_at: DateTime<Utc>, cancel: CancellationToken) -> Self {
        Self {
            run_id: run.id,
            task_name: run.task_name.clone(),
            attempt: run.attempt,
            started_at,
            payload: run.payload.clone(),
            cancel,
        }
    }

    /// Bodies check this at safe points (e.g. before each per-lead mutation).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Executor error. Handler failures are not errors here; they are recorded on
/// the run itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] TaskRunStoreError),
    #[error("no handler registered for task `{0}`")]
    UnknownTask(String),
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Try asynchronous execution (subject to the broker probe).
    pub broker_enabled: bool,
    /// Worker threads in asynchronous mode
    pub workers: usize,
    /// How often idle workers poll for runs
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            broker_enabled: false,
            workers: 4,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Attempts executed
    pub runs_processed: u64,
    pub runs_succeeded: u64,
    /// Failed attempts, retried or not
    pub runs_failed: u64,
    /// Runs that exhausted their attempts
    pub runs_terminal_failed: u64,
    pub runs_cancelled: u64,
}

/// Shared by every runner: executes one claimed run and records the outcome.
pub struct ExecutorCore {
    store: Arc<dyn TaskRunStore>,
    handlers: HashMap<String, TaskHandler>,
    stats: Mutex<ExecutorStats>,
}

impl ExecutorCore {
    pub fn store(&self) -> &Arc<dyn TaskRunStore> {
        &self.store
    }

    pub fn has_handler(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Execute one attempt of a run already claimed (`Running`) and persist
    /// the resulting state.
    pub fn execute(&self, run: &mut TaskRun) -> Result<(), ExecutorError> {
        let started = Utc::now();
        let token = self.store.cancellation_token(run.id)?;

        let outcome = match self.handlers.get(&run.task_name) {
            Some(handler) => {
                let ctx = JobContext::new(run, started, token);
                debug!(task = %run.task_name, run_id = %run.id, attempt = run.attempt, "executing task");
                match panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))) {
                    Ok(JobResult::Success(summary)) => Ok(Some(summary)),
                    Ok(JobResult::Cancelled) => Ok(None),
                    Ok(JobResult::Failure(message)) => Err(TaskExecutionError::Body(message)),
                    Err(payload) => Err(TaskExecutionError::Panicked(panic_message(payload.as_ref()))),
                }
            }
            None => Err(TaskExecutionError::NoHandler(run.task_name.clone())),
        };

        let now = Utc::now();
        match outcome {
            Ok(Some(summary)) => {
                run.mark_succeeded(summary, started, now);
                info!(task = %run.task_name, run_id = %run.id, attempt = run.attempt, "task succeeded");
            }
            Ok(None) => {
                run.mark_cancelled(now);
                info!(task = %run.task_name, run_id = %run.id, "task cancelled while running");
            }
            Err(e) => {
                run.mark_failed(e.to_string(), started, now);
                match &run.state {
                    TaskRunState::Failed { attempts, .. } => warn!(
                        task = %run.task_name,
                        run_id = %run.id,
                        attempts,
                        error = %e,
                        "task failed; retries exhausted"
                    ),
                    _ => info!(
                        task = %run.task_name,
                        run_id = %run.id,
                        attempt = run.attempt,
                        retry_at = ?run.next_attempt_at,
                        error = %e,
                        "task attempt failed; retry scheduled"
                    ),
                }
            }
        }

        self.store.update(run)?;
        self.record(&run.state);
        Ok(())
    }

    fn record(&self, state: &TaskRunState) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        s.runs_processed += 1;
        match state {
            TaskRunState::Succeeded => s.runs_succeeded += 1,
            TaskRunState::Cancelled => s.runs_cancelled += 1,
            TaskRunState::Failed { .. } => {
                s.runs_failed += 1;
                s.runs_terminal_failed += 1;
            }
            TaskRunState::Retrying { .. } => s.runs_failed += 1,
            TaskRunState::Scheduled | TaskRunState::Running => {}
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Builder collecting task handlers before a runner is chosen.
pub struct TaskExecutorBuilder {
    store: Arc<dyn TaskRunStore>,
    handlers: HashMap<String, TaskHandler>,
}

impl TaskExecutorBuilder {
    /// Register the body for `task_name`, replacing any previous one.
    pub fn register_handler<F>(mut self, task_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(task_name.into(), Arc::new(handler));
        self
    }

    /// Pick the runner for this session.
    ///
    /// Asynchronous execution is used only when the broker is enabled and the
    /// probe succeeds; otherwise every submission runs inline. The choice is
    /// made once and is not revisited.
    pub fn build(self, config: &ExecutorConfig, probe: &dyn BrokerProbe) -> TaskExecutor {
        let core = Arc::new(ExecutorCore {
            store: self.store,
            handlers: self.handlers,
            stats: Mutex::new(ExecutorStats::default()),
        });

        let runner: Box<dyn TaskRunner> = if !config.broker_enabled {
            info!("broker disabled; tasks run inline");
            Box::new(InlineRunner::new(core.clone()))
        } else {
            match probe.check() {
                Ok(()) => {
                    info!(workers = config.workers, "broker reachable; tasks run on worker pool");
                    Box::new(AsyncRunner::spawn(
                        core.clone(),
                        config.workers,
                        config.poll_interval,
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "broker unavailable; degrading to inline execution for this session");
                    Box::new(InlineRunner::new(core.clone()))
                }
            }
        };

        TaskExecutor { core, runner }
    }
}

/// Runs task bodies through the selected [`TaskRunner`].
pub struct TaskExecutor {
    core: Arc<ExecutorCore>,
    runner: Box<dyn TaskRunner>,
}

impl TaskExecutor {
    pub fn builder(store: Arc<dyn TaskRunStore>) -> TaskExecutorBuilder {
        TaskExecutorBuilder {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.runner.mode()
    }

    pub fn store(&self) -> &Arc<dyn TaskRunStore> {
        self.core.store()
    }

    pub fn has_handler(&self, task_name: &str) -> bool {
        self.core.has_handler(task_name)
    }

    /// Hand a new run to the runner.
    ///
    /// Inline: returns once the run is terminal. Async: returns once queued.
    pub fn submit(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        if !self.core.has_handler(&run.task_name) {
            return Err(ExecutorError::UnknownTask(run.task_name));
        }
        self.runner.submit(run)
    }

    /// Hand a new run to the runner without blocking on retry backoff.
    ///
    /// Inline: runs the first attempt; a run that must retry is returned as
    /// `Queued` and picked up by [`TaskExecutor::drive_ready`].
    pub fn dispatch(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        if !self.core.has_handler(&run.task_name) {
            return Err(ExecutorError::UnknownTask(run.task_name));
        }
        self.runner.dispatch(run)
    }

    /// Attempt runs whose backoff has elapsed by `now` (inline mode only).
    pub fn drive_ready(&self, now: DateTime<Utc>) -> Result<Vec<TaskRunId>, ExecutorError> {
        self.runner.drive_ready(now)
    }

    pub fn cancel(&self, id: TaskRunId) -> Result<CancelOutcome, ExecutorError> {
        let outcome = self.store().request_cancel(id, Utc::now())?;
        info!(run_id = %id, outcome = ?outcome, "task run cancellation");
        Ok(outcome)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.core.stats()
    }

    /// Stop worker threads (async mode). Idempotent.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }

    /// Terminal state of a submission, for inline results or a later lookup.
    pub fn outcome(&self, submission: &Submission) -> Result<Option<JsonValue>, ExecutorError> {
        let run = match submission {
            Submission::Completed(run) => Some(run.clone()),
            Submission::Queued(id) => self.store().get(*id)?,
        };
        Ok(run.and_then(|r| r.result))
    }
}
