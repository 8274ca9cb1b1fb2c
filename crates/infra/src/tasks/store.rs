//! Task run storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{
    CancellationToken, IdempotencyClass, TaskExecutionError, TaskRun, TaskRunId, TaskRunState,
};

/// Task run store abstraction.
pub trait TaskRunStore: Send + Sync {
    /// Enqueue a new run.
    fn enqueue(&self, run: TaskRun) -> Result<TaskRunId, TaskRunStoreError>;

    fn get(&self, id: TaskRunId) -> Result<Option<TaskRun>, TaskRunStoreError>;

    /// Replace a stored run.
    fn update(&self, run: &TaskRun) -> Result<(), TaskRunStoreError>;

    /// Claim the oldest claimable run whose backoff has elapsed, marking it
    /// `Running`. Returns `None` if nothing is ready.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<TaskRun>, TaskRunStoreError>;

    /// Claim one specific run if it is claimable and ready.
    fn claim(&self, id: TaskRunId, now: DateTime<Utc>) -> Result<Option<TaskRun>, TaskRunStoreError>;

    /// Runs matching `filter`, most recently created first.
    fn list(&self, filter: &TaskRunFilter) -> Result<Vec<TaskRun>, TaskRunStoreError>;

    /// Cancel a run. Runs that have not started are cancelled outright; a
    /// running run only gets its cancellation token set.
    fn request_cancel(
        &self,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, TaskRunStoreError>;

    fn cancellation_token(&self, id: TaskRunId) -> Result<CancellationToken, TaskRunStoreError>;

    /// Re-queue or fail runs stuck in `Running` since before `cutoff`.
    fn recover_abandoned(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRunId>, TaskRunStoreError>;

    /// Drop terminal runs last updated before `before`. Returns how many.
    fn prune(&self, before: DateTime<Utc>) -> Result<usize, TaskRunStoreError>;

    fn stats(&self) -> Result<TaskRunStats, TaskRunStoreError>;
}

/// Task run store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskRunStoreError {
    #[error("task run not found: {0}")]
    NotFound(TaskRunId),
    #[error("task run already exists: {0}")]
    AlreadyExists(TaskRunId),
    #[error("task run {0} already finished")]
    AlreadyFinished(TaskRunId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// What [`TaskRunStore::request_cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The run had not started and is now `Cancelled`.
    Cancelled,
    /// The run is executing; its body will see the request at its next check.
    Requested,
}

/// Query over stored runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRunFilter {
    pub task_name: Option<String>,
    /// Matched by variant; payloads are ignored.
    pub state: Option<TaskRunState>,
    pub limit: Option<usize>,
}

impl TaskRunFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_task(name: impl Into<String>) -> Self {
        Self {
            task_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: TaskRunState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &TaskRun) -> bool {
        self.task_name.as_ref().is_none_or(|n| *n == run.task_name)
            && self
                .state
                .as_ref()
                .is_none_or(|s| std::mem::discriminant(&run.state) == std::mem::discriminant(s))
    }
}

/// Task run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskRunStats {
    pub scheduled: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-memory task run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskRunStore {
    runs: RwLock<HashMap<TaskRunId, TaskRun>>,
    tokens: RwLock<HashMap<TaskRunId, CancellationToken>>,
}

impl InMemoryTaskRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read_runs(&self) -> Result<RwLockReadGuard<'_, HashMap<TaskRunId, TaskRun>>, TaskRunStoreError> {
        self.runs.read().map_err(|_| poisoned())
    }

    fn write_runs(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<TaskRunId, TaskRun>>, TaskRunStoreError> {
        self.runs.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> TaskRunStoreError {
    TaskRunStoreError::Storage("task run store lock poisoned".into())
}

impl TaskRunStore for InMemoryTaskRunStore {
    fn enqueue(&self, run: TaskRun) -> Result<TaskRunId, TaskRunStoreError> {
        let mut runs = self.write_runs()?;
        if runs.contains_key(&run.id) {
            return Err(TaskRunStoreError::AlreadyExists(run.id));
        }
        let id = run.id;
        runs.insert(id, run);
        Ok(id)
    }

    fn get(&self, id: TaskRunId) -> Result<Option<TaskRun>, TaskRunStoreError> {
        Ok(self.read_runs()?.get(&id).cloned())
    }

    fn update(&self, run: &TaskRun) -> Result<(), TaskRunStoreError> {
        let mut runs = self.write_runs()?;
        match runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(TaskRunStoreError::NotFound(run.id)),
        }
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<TaskRun>, TaskRunStoreError> {
        let mut runs = self.write_runs()?;

        // Oldest ready run first (FIFO).
        let next = runs
            .values()
            .filter(|r| r.state.is_claimable() && r.is_ready(now))
            .min_by_key(|r| (r.next_attempt_at.unwrap_or(r.created_at), r.created_at))
            .map(|r| r.id);

        Ok(next.and_then(|id| {
            runs.get_mut(&id).map(|run| {
                run.mark_running(now);
                run.clone()
            })
        }))
    }

    fn claim(&self, id: TaskRunId, now: DateTime<Utc>) -> Result<Option<TaskRun>, TaskRunStoreError> {
        let mut runs = self.write_runs()?;
        let run = runs.get_mut(&id).ok_or(TaskRunStoreError::NotFound(id))?;
        if run.state.is_claimable() && run.is_ready(now) {
            run.mark_running(now);
            Ok(Some(run.clone()))
        } else {
            Ok(None)
        }
    }

    fn list(&self, filter: &TaskRunFilter) -> Result<Vec<TaskRun>, TaskRunStoreError> {
        let runs = self.read_runs()?;
        let mut result: Vec<TaskRun> = runs.values().filter(|r| filter.matches(r)).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn request_cancel(
        &self,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, TaskRunStoreError> {
        {
            let mut runs = self.write_runs()?;
            let run = runs.get_mut(&id).ok_or(TaskRunStoreError::NotFound(id))?;
            match run.state {
                TaskRunState::Scheduled | TaskRunState::Retrying { .. } => {
                    run.mark_cancelled(now);
                    return Ok(CancelOutcome::Cancelled);
                }
                TaskRunState::Running => {}
                _ => return Err(TaskRunStoreError::AlreadyFinished(id)),
            }
        }

        self.cancellation_token(id)?.cancel();
        Ok(CancelOutcome::Requested)
    }

    fn cancellation_token(&self, id: TaskRunId) -> Result<CancellationToken, TaskRunStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        Ok(tokens.entry(id).or_default().clone())
    }

    fn recover_abandoned(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRunId>, TaskRunStoreError> {
        let mut runs = self.write_runs()?;
        let mut recovered = Vec::new();

        for run in runs.values_mut() {
            if run.state != TaskRunState::Running || run.updated_at >= cutoff {
                continue;
            }
            let error = TaskExecutionError::Abandoned.to_string();
            if run.idempotency == IdempotencyClass::SafeToRepeat
                && run.retry_policy.should_retry(run.attempt)
            {
                run.state = TaskRunState::Retrying {
                    error,
                    attempt: run.attempt,
                };
                run.next_attempt_at = Some(now);
            } else {
                run.state = TaskRunState::Failed {
                    error,
                    attempts: run.attempt,
                };
                run.next_attempt_at = None;
            }
            run.updated_at = now;
            recovered.push(run.id);
        }

        Ok(recovered)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize, TaskRunStoreError> {
        let mut runs = self.write_runs()?;
        let stale: Vec<TaskRunId> = runs
            .values()
            .filter(|r| r.state.is_terminal() && r.updated_at < before)
            .map(|r| r.id)
            .collect();

        for id in &stale {
            runs.remove(id);
        }
        drop(runs);

        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        for id in &stale {
            tokens.remove(id);
        }
        Ok(stale.len())
    }

    fn stats(&self) -> Result<TaskRunStats, TaskRunStoreError> {
        let runs = self.read_runs()?;
        let mut stats = TaskRunStats::default();

        for run in runs.values() {
            match &run.state {
                TaskRunState::Scheduled => stats.scheduled += 1,
                TaskRunState::Running => stats.running += 1,
                TaskRunState::Retrying { .. } => stats.retrying += 1,
                TaskRunState::Succeeded => stats.succeeded += 1,
                TaskRunState::Failed { .. } => stats.failed += 1,
                TaskRunState::Cancelled => stats.cancelled += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::{RetryPolicy, TaskDefinition};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn run(name: &str, at: DateTime<Utc>) -> TaskRun {
        TaskRun::new(&TaskDefinition::new(name), at)
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryTaskRunStore::new();
        let id = store.enqueue(run("snooze-expiration", t0())).unwrap();

        let claimed = store.claim_next(t0()).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, TaskRunState::Running);
        assert_eq!(claimed.attempt, 1);

        // No more runs
        assert!(store.claim_next(t0()).unwrap().is_none());
    }

    #[test]
    fn claim_respects_backoff() {
        let store = InMemoryTaskRunStore::new();
        let mut r = run("score-refresh", t0());
        r.mark_running(t0());
        r.mark_failed("boom".into(), t0(), t0());
        let retry_at = r.next_attempt_at.unwrap();
        let id = store.enqueue(r).unwrap();

        assert!(store.claim(id, t0()).unwrap().is_none());
        assert!(store.claim_next(t0()).unwrap().is_none());
        let claimed = store.claim(id, retry_at).unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
    }

    #[test]
    fn claim_next_is_fifo() {
        let store = InMemoryTaskRunStore::new();
        let later = store.enqueue(run("b", t0() + Duration::seconds(5))).unwrap();
        let earlier = store.enqueue(run("a", t0())).unwrap();

        let now = t0() + Duration::seconds(10);
        assert_eq!(store.claim_next(now).unwrap().unwrap().id, earlier);
        assert_eq!(store.claim_next(now).unwrap().unwrap().id, later);
    }

    #[test]
    fn list_filters_by_name_and_state_variant() {
        let store = InMemoryTaskRunStore::new();
        store.enqueue(run("a", t0())).unwrap();
        store.enqueue(run("a", t0() + Duration::seconds(1))).unwrap();
        store.enqueue(run("b", t0())).unwrap();
        store.claim_next(t0()).unwrap();

        assert_eq!(store.list(&TaskRunFilter::for_task("a")).unwrap().len(), 2);
        let failed_like = TaskRunFilter::all().with_state(TaskRunState::Failed {
            error: String::new(),
            attempts: 0,
        });
        assert!(store.list(&failed_like).unwrap().is_empty());
        assert_eq!(
            store
                .list(&TaskRunFilter::all().with_state(TaskRunState::Scheduled))
                .unwrap()
                .len(),
            2
        );

        let newest = store.list(&TaskRunFilter::for_task("a").with_limit(1)).unwrap();
        assert_eq!(newest[0].scheduled_for, t0() + Duration::seconds(1));
    }

    #[test]
    fn cancel_before_and_during_running() {
        let store = InMemoryTaskRunStore::new();
        let pending = store.enqueue(run("a", t0())).unwrap();
        assert_eq!(
            store.request_cancel(pending, t0()).unwrap(),
            CancelOutcome::Cancelled
        );
        assert!(store.claim_next(t0()).unwrap().is_none());

        let running = store.enqueue(run("b", t0())).unwrap();
        let token = store.cancellation_token(running).unwrap();
        store.claim_next(t0()).unwrap().unwrap();
        assert_eq!(
            store.request_cancel(running, t0()).unwrap(),
            CancelOutcome::Requested
        );
        assert!(token.is_cancelled());

        assert_eq!(
            store.request_cancel(pending, t0()).unwrap_err(),
            TaskRunStoreError::AlreadyFinished(pending)
        );
    }

    #[test]
    fn abandoned_runs_are_requeued_or_failed() {
        let store = InMemoryTaskRunStore::new();
        let safe = store.enqueue(run("score-refresh", t0())).unwrap();
        let unsafe_def = TaskDefinition::new("model-training")
            .with_idempotency(IdempotencyClass::NotSafeToRepeat)
            .with_retry_policy(RetryPolicy::fixed(3, std::time::Duration::from_secs(1)));
        let not_safe = store.enqueue(TaskRun::new(&unsafe_def, t0())).unwrap();
        store.claim(safe, t0()).unwrap().unwrap();
        store.claim(not_safe, t0()).unwrap().unwrap();

        let now = t0() + Duration::hours(2);
        let mut recovered = store.recover_abandoned(t0() + Duration::hours(1), now).unwrap();
        recovered.sort();
        let mut expected = vec![safe, not_safe];
        expected.sort();
        assert_eq!(recovered, expected);

        assert!(matches!(
            store.get(safe).unwrap().unwrap().state,
            TaskRunState::Retrying { attempt: 1, .. }
        ));
        assert!(matches!(
            store.get(not_safe).unwrap().unwrap().state,
            TaskRunState::Failed { attempts: 1, .. }
        ));

        // Recent runs are left alone.
        assert!(store.recover_abandoned(t0(), now).unwrap().is_empty());
    }

    #[test]
    fn prune_drops_only_old_terminal_runs() {
        let store = InMemoryTaskRunStore::new();
        let done = store.enqueue(run("a", t0())).unwrap();
        let mut r = store.claim(done, t0()).unwrap().unwrap();
        r.mark_succeeded(serde_json::json!({}), t0(), t0());
        store.update(&r).unwrap();
        let open = store.enqueue(run("b", t0())).unwrap();

        assert_eq!(store.prune(t0() + Duration::days(8)).unwrap(), 1);
        assert!(store.get(done).unwrap().is_none());
        assert!(store.get(open).unwrap().is_some());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryTaskRunStore::new();
        for i in 0..5 {
            store.enqueue(run("a", t0() + Duration::seconds(i))).unwrap();
        }

        assert_eq!(store.stats().unwrap().scheduled, 5);

        let now = t0() + Duration::minutes(1);
        store.claim_next(now).unwrap();
        store.claim_next(now).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.scheduled, 3);
        assert_eq!(stats.running, 2);
    }
}
