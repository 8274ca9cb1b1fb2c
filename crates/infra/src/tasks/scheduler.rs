//! Periodic task scheduling.
//!
//! [`due_tasks`] is the whole scheduling decision and is a pure function of
//! (definitions, run history, now). [`TaskScheduler`] applies it and hands due
//! runs to the executor; [`SchedulerLoop`] drives ticks on a thread.

use std::collections::BTreeMap;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use super::executor::{ExecutorError, TaskExecutor};
use super::runner::Submission;
use super::store::{TaskRunFilter, TaskRunStoreError};
use super::types::{ScheduleBasis, TaskDefinition, TaskRun, TaskRunId, TaskRunState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error(transparent)]
    Store(#[from] TaskRunStoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Ordered set of task definitions, built once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRegistry {
    definitions: Vec<TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), SchedulerError> {
        if self.get(&definition.name).is_some() {
            return Err(SchedulerError::DuplicateTask(definition.name));
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn definitions(&self) -> &[TaskDefinition] {
        &self.definitions
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.name.as_str())
    }

    /// Replace the interval of each named task.
    pub fn apply_interval_overrides(
        &mut self,
        overrides: &BTreeMap<String, Duration>,
    ) -> Result<(), SchedulerError> {
        for (name, interval) in overrides {
            let def = self
                .definitions
                .iter_mut()
                .find(|d| d.name == *name)
                .ok_or_else(|| SchedulerError::UnknownTask(name.clone()))?;
            info!(task = %name, interval_secs = interval.as_secs(), "task interval overridden");
            def.interval = Some(*interval);
        }
        Ok(())
    }
}

/// Definitions that should fire at `now`.
///
/// A definition is due when it is periodic, has no open run, and its interval
/// has elapsed since its basis run (or it has never had one).
pub fn due_tasks<'a>(
    definitions: &'a [TaskDefinition],
    runs: &[TaskRun],
    now: DateTime<Utc>,
) -> Vec<&'a TaskDefinition> {
    definitions
        .iter()
        .filter(|def| {
            let Some(interval) = def.interval else {
                return false;
            };
            let own = runs.iter().filter(|r| r.task_name == def.name);
            if own.clone().any(|r| r.state.is_open()) {
                return false;
            }

            let basis = own
                .filter(|r| match def.basis {
                    ScheduleBasis::LastSuccess => r.state == TaskRunState::Succeeded,
                    ScheduleBasis::LastAttempt => r.state != TaskRunState::Cancelled,
                })
                .map(|r| r.scheduled_for)
                .max();

            match basis {
                None => true,
                Some(at) => {
                    let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
                    now - at >= interval
                }
            }
        })
        .collect()
}

/// Housekeeping thresholds applied on every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// A `Running` run not updated for this long is abandoned.
    pub run_timeout: Duration,
    /// Terminal runs older than this are pruned.
    pub run_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(3600),
            run_retention: Duration::from_secs(168 * 3600),
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub recovered: Vec<TaskRunId>,
    /// Retrying runs given another attempt (inline mode).
    pub retried: Vec<TaskRunId>,
    pub submitted: Vec<TaskRunId>,
    pub pruned: usize,
}

pub struct TaskScheduler {
    registry: TaskRegistry,
    executor: Arc<TaskExecutor>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(registry: TaskRegistry, executor: Arc<TaskExecutor>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            executor,
            config,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Recover abandoned runs, retry runs whose backoff elapsed, submit due
    /// tasks, prune old runs.
    ///
    /// Each run gets at most one attempt per tick, so a failing task waits for
    /// a later tick instead of holding up the others. A failing submission is
    /// logged and does not keep other due tasks from being submitted.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let store = self.executor.store();
        let mut report = TickReport::default();

        let cutoff = before(now, self.config.run_timeout);
        report.recovered = store.recover_abandoned(cutoff, now)?;
        for id in &report.recovered {
            warn!(run_id = %id, "recovered abandoned task run");
        }

        match self.executor.drive_ready(now) {
            Ok(retried) => report.retried = retried,
            Err(e) => error!(error = %e, "failed to retry pending task runs"),
        }

        let runs = store.list(&TaskRunFilter::all())?;
        for def in due_tasks(self.registry.definitions(), &runs, now) {
            match self.executor.dispatch(TaskRun::new(def, now)) {
                Ok(submission) => report.submitted.push(submission.run_id()),
                Err(e) => error!(task = %def.name, error = %e, "failed to submit due task"),
            }
        }

        report.pruned = store.prune(before(now, self.config.run_retention))?;
        Ok(report)
    }

    /// Submit a run of `name` now, regardless of its interval.
    pub fn run_now(&self, name: &str) -> Result<Submission, SchedulerError> {
        self.run_now_with(name, JsonValue::Null)
    }

    /// Submit a run of `name` carrying `payload` for its body.
    pub fn run_now_with(&self, name: &str, payload: JsonValue) -> Result<Submission, SchedulerError> {
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        info!(task = %name, mode = %self.executor.mode(), "manual task run requested");
        Ok(self
            .executor
            .submit(TaskRun::new(def, Utc::now()).with_payload(payload))?)
    }
}

/// `now - d`, clamped to the earliest representable time.
fn before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Handle to a running scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Drives [`TaskScheduler::tick`] on a dedicated thread.
pub struct SchedulerLoop;

impl SchedulerLoop {
    pub fn spawn(scheduler: Arc<TaskScheduler>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let tick_interval = scheduler.config().tick_interval;

        let join = thread::Builder::new()
            .name("task-scheduler".to_string())
            .spawn(move || {
                info!(tick_secs = tick_interval.as_secs_f64(), "task scheduler started");
                loop {
                    match scheduler.tick(Utc::now()) {
                        Ok(report)
                            if !report.submitted.is_empty()
                                || !report.retried.is_empty()
                                || report.pruned > 0 =>
                        {
                            info!(
                                submitted = report.submitted.len(),
                                retried = report.retried.len(),
                                recovered = report.recovered.len(),
                                pruned = report.pruned,
                                "scheduler tick"
                            )
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }

                    match shutdown_rx.recv_timeout(tick_interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                info!("task scheduler stopped");
            })
            .expect("failed to spawn task scheduler thread");

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
