//! Core task types and policies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Unique task run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRunId(pub Uuid);

impl TaskRunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a task body may run again after an attempt of unknown outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyClass {
    SafeToRepeat,
    NotSafeToRepeat,
}

/// Which past run the interval of a periodic task is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleBasis {
    LastSuccess,
    LastAttempt,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    ///
    /// Never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Another attempt is allowed after `attempt` attempts have been made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Static description of a background task.
///
/// Built once at startup (see [`crate::tasks::TaskRegistry`]); never created or
/// destroyed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    /// `None` for on-demand tasks the scheduler never fires by itself.
    pub interval: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub idempotency: IdempotencyClass,
    pub basis: ScheduleBasis,
}

impl TaskDefinition {
    /// An on-demand, safe-to-repeat task with the default retry policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: None,
            retry_policy: RetryPolicy::default(),
            idempotency: IdempotencyClass::SafeToRepeat,
            basis: ScheduleBasis::LastSuccess,
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_idempotency(mut self, idempotency: IdempotencyClass) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn with_basis(mut self, basis: ScheduleBasis) -> Self {
        self.basis = basis;
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.interval.is_some()
    }
}

/// Task run lifecycle.
///
/// `Scheduled → Running → {Succeeded, Retrying, Failed}`;
/// `Retrying → Running` while attempts remain. `Retrying` is the
/// "failed, will retry" state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskRunState {
    /// Waiting to be picked up
    Scheduled,
    /// Currently being executed
    Running,
    /// Last attempt failed; another one is scheduled
    Retrying { error: String, attempt: u32 },
    Succeeded,
    /// Attempts exhausted (terminal)
    Failed { error: String, attempts: u32 },
    Cancelled,
}

impl TaskRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskRunState::Succeeded | TaskRunState::Failed { .. } | TaskRunState::Cancelled
        )
    }

    /// Scheduled, running, or waiting for a retry.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Can be picked up by a runner (given its backoff has elapsed).
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskRunState::Scheduled | TaskRunState::Retrying { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskRunState::Scheduled => "scheduled",
            TaskRunState::Running => "running",
            TaskRunState::Retrying { .. } => "retrying",
            TaskRunState::Succeeded => "succeeded",
            TaskRunState::Failed { .. } => "failed",
            TaskRunState::Cancelled => "cancelled",
        }
    }
}

/// Record of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One firing of a [`TaskDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub task_name: String,
    /// The instant the run was due.
    pub scheduled_for: DateTime<Utc>,
    /// Attempts started so far.
    pub attempt: u32,
    pub state: TaskRunState,
    pub retry_policy: RetryPolicy,
    pub idempotency: IdempotencyClass,
    /// Arguments for on-demand tasks; `null` for periodic firings.
    #[serde(default)]
    pub payload: JsonValue,
    /// Earliest time the next attempt may start (backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Summary returned by the task body on success.
    pub result: Option<JsonValue>,
    pub history: Vec<AttemptRecord>,
}

impl TaskRun {
    pub fn new(definition: &TaskDefinition, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: TaskRunId::new(),
            task_name: definition.name.clone(),
            scheduled_for,
            attempt: 0,
            state: TaskRunState::Scheduled,
            retry_policy: definition.retry_policy.clone(),
            idempotency: definition.idempotency,
            payload: JsonValue::Null,
            next_attempt_at: None,
            created_at: scheduled_for,
            updated_at: scheduled_for,
            result: None,
            history: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Backoff (if any) has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| now >= at)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.state = TaskRunState::Running;
        self.attempt += 1;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    pub fn mark_succeeded(
        &mut self,
        result: JsonValue,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = TaskRunState::Succeeded;
        self.result = Some(result);
        self.record_attempt(started_at, now, None);
    }

    /// Record a failed attempt and either schedule a retry or fail terminally.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.record_attempt(started_at, now, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.next_attempt_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.state = TaskRunState::Retrying {
                error,
                attempt: self.attempt,
            };
        } else {
            self.next_attempt_at = None;
            self.state = TaskRunState::Failed {
                error,
                attempts: self.attempt,
            };
        }
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.state = TaskRunState::Cancelled;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// Error summary of the last failed attempt, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|a| a.error.as_deref())
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>) {
        self.updated_at = now;
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Outcome reported by a task body.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Completed; the value is a summary kept on the run.
    Success(JsonValue),
    /// Failed; retried per the run's policy.
    Failure(String),
    /// Stopped early after observing a cancellation request.
    Cancelled,
}

/// Why an attempt failed. Its message becomes the run's error summary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskExecutionError {
    #[error("{0}")]
    Body(String),
    #[error("task body panicked: {0}")]
    Panicked(String),
    #[error("no handler registered for task `{0}`")]
    NoHandler(String),
    #[error("run abandoned: no progress before the run timeout")]
    Abandoned,
}

/// Cooperative cancellation flag shared between a run's store entry and the
/// body executing it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
