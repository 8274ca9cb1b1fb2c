//! The two ways of running a submitted task: inline in the caller's thread,
//! or queued for a pool of worker threads.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use super::executor::{ExecutorCore, ExecutorError};
use super::store::TaskRunFilter;
use super::types::{TaskRun, TaskRunId};

/// How submissions are executed for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Worker pool; `submit` returns as soon as the run is queued.
    Async,
    /// Degraded mode; `submit` runs the task to a terminal state first.
    Inline,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Async => f.write_str("async"),
            ExecutionMode::Inline => f.write_str("inline"),
        }
    }
}

/// Result of handing a run to a runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Queued for a worker; look it up later.
    Queued(TaskRunId),
    /// Ran to a terminal state before returning.
    Completed(TaskRun),
}

impl Submission {
    pub fn run_id(&self) -> TaskRunId {
        match self {
            Submission::Queued(id) => *id,
            Submission::Completed(run) => run.id,
        }
    }
}

/// Strategy for running submitted task runs.
pub trait TaskRunner: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Caller-initiated submission.
    fn submit(&self, run: TaskRun) -> Result<Submission, ExecutorError>;

    /// Scheduler submission; must not wait out retry backoff. Defaults to
    /// [`TaskRunner::submit`].
    fn dispatch(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        self.submit(run)
    }

    /// Give each claimable run that is ready at `now` one attempt. Runners
    /// with their own workers leave this to them.
    fn drive_ready(&self, _now: DateTime<Utc>) -> Result<Vec<TaskRunId>, ExecutorError> {
        Ok(Vec::new())
    }

    fn shutdown(&self) {}
}

/// Runs submissions in the calling thread.
///
/// `submit` runs to completion, sleeping out retry backoff in between
/// attempts. `dispatch` runs a single attempt and leaves a retrying run in the
/// store for a later [`TaskRunner::drive_ready`].
pub struct InlineRunner {
    core: Arc<ExecutorCore>,
}

impl InlineRunner {
    pub fn new(core: Arc<ExecutorCore>) -> Self {
        Self { core }
    }
}

impl TaskRunner for InlineRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    fn submit(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        let store = self.core.store();
        let id = store.enqueue(run)?;

        loop {
            if let Some(mut claimed) = store.claim(id, Utc::now())? {
                self.core.execute(&mut claimed)?;
                if claimed.state.is_terminal() {
                    return Ok(Submission::Completed(claimed));
                }
            }

            let Some(current) = store.get(id)? else {
                return Err(ExecutorError::Store(super::store::TaskRunStoreError::NotFound(id)));
            };
            if current.state.is_terminal() {
                // e.g. cancelled while waiting out a backoff
                return Ok(Submission::Completed(current));
            }

            let wait = current
                .next_attempt_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::from_millis(1));
            debug!(run_id = %id, wait_ms = wait.as_millis() as u64, "waiting for retry backoff");
            thread::sleep(wait);
        }
    }

    fn dispatch(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        let store = self.core.store();
        let id = store.enqueue(run)?;

        match store.claim(id, Utc::now())? {
            Some(mut claimed) => {
                self.core.execute(&mut claimed)?;
                if claimed.state.is_terminal() {
                    Ok(Submission::Completed(claimed))
                } else {
                    Ok(Submission::Queued(id))
                }
            }
            None => Ok(Submission::Queued(id)),
        }
    }

    fn drive_ready(&self, now: DateTime<Utc>) -> Result<Vec<TaskRunId>, ExecutorError> {
        let store = self.core.store();
        let ready: Vec<TaskRunId> = store
            .list(&TaskRunFilter::all())?
            .into_iter()
            .filter(|r| r.state.is_claimable() && r.is_ready(now))
            .map(|r| r.id)
            .collect();

        let mut driven = Vec::with_capacity(ready.len());
        for id in ready {
            // One attempt each; the outcome is recorded on the run.
            if let Some(mut claimed) = store.claim(id, now)? {
                self.core.execute(&mut claimed)?;
                driven.push(id);
            }
        }
        Ok(driven)
    }
}

/// Queues submissions for a fixed pool of worker threads that poll the store.
pub struct AsyncRunner {
    core: Arc<ExecutorCore>,
    workers: Mutex<Vec<Worker>>,
}

struct Worker {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl AsyncRunner {
    pub fn spawn(core: Arc<ExecutorCore>, workers: usize, poll_interval: Duration) -> Self {
        let workers = (0..workers.max(1))
            .map(|i| {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let core = core.clone();
                let name = format!("task-worker-{i}");
                let join = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker_loop(&name, &core, shutdown_rx, poll_interval))
                    .expect("failed to spawn task worker thread");
                Worker {
                    shutdown: shutdown_tx,
                    join: Some(join),
                }
            })
            .collect();

        Self {
            core,
            workers: Mutex::new(workers),
        }
    }
}

impl TaskRunner for AsyncRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    fn submit(&self, run: TaskRun) -> Result<Submission, ExecutorError> {
        let id = self.core.store().enqueue(run)?;
        Ok(Submission::Queued(id))
    }

    fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for w in workers.iter() {
            let _ = w.shutdown.send(());
        }
        for w in workers.iter_mut() {
            if let Some(j) = w.join.take() {
                let _ = j.join();
            }
        }
        workers.clear();
    }
}

impl Drop for AsyncRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    name: &str,
    core: &ExecutorCore,
    shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    info!(worker = %name, "task worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match core.store().claim_next(Utc::now()) {
            Ok(Some(mut run)) => {
                debug!(worker = %name, run_id = %run.id, task = %run.task_name, "claimed run");
                if let Err(e) = core.execute(&mut run) {
                    error!(worker = %name, run_id = %run.id, error = %e, "failed to record run outcome");
                }
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                error!(worker = %name, error = %e, "failed to claim run");
                thread::sleep(poll_interval);
            }
        }
    }

    info!(worker = %name, "task worker stopped");
}
