//! Task bodies and the standard task registry.
//!
//! Each body is a plain function over the repositories so it can be called
//! directly; [`register_handlers`] wraps them as executor handlers. Bodies
//! are idempotent under at-least-once execution and check for cancellation
//! before touching each record.

pub mod calendar_invite;
pub mod follow_up;
pub mod performance;
pub mod score_refresh;
pub mod snooze;
pub mod training;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;

use leadflow_core::{AgentId, LeadId};
use leadflow_scoring::{LeadScorer, Trainer, TrainingError};

use crate::notify::{NotificationDeliveryError, NotificationSink};
use crate::repository::{
    AgentDirectory, InteractionLog, LeadRepository, PerformanceStore, RepositoryError,
};
use crate::tasks::{
    IdempotencyClass, JobResult, RetryPolicy, ScheduleBasis, SchedulerError, TaskDefinition,
    TaskExecutorBuilder, TaskRegistry,
};

pub const SCORE_REFRESH: &str = "score-refresh";
pub const FOLLOW_UP_REMINDERS: &str = "follow-up-reminders";
pub const SNOOZE_EXPIRATION: &str = "snooze-expiration";
pub const AGENT_PERFORMANCE: &str = "agent-performance";
pub const MODEL_TRAINING: &str = "model-training";
pub const CALENDAR_INVITE: &str = "calendar-invite";

/// Why a job body stopped without completing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{failed} reminder(s) not delivered; first failure for lead {lead_id}: {source}")]
    Delivery {
        failed: usize,
        lead_id: LeadId,
        source: NotificationDeliveryError,
    },
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
}

impl JobError {
    /// Executor view of a body's outcome.
    pub fn into_job_result<T: Serialize>(result: Result<T, JobError>) -> JobResult {
        match result {
            Ok(report) => JobResult::Success(serde_json::to_value(report).unwrap_or(JsonValue::Null)),
            Err(JobError::Cancelled) => JobResult::Cancelled,
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

fn exponential(max_attempts: u32, base_secs: u64, max_secs: u64) -> RetryPolicy {
    RetryPolicy::exponential(
        max_attempts,
        Duration::from_secs(base_secs),
        Duration::from_secs(max_secs),
    )
}

/// The built-in periodic jobs and the on-demand training and invitation jobs.
pub fn standard_definitions() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new(SCORE_REFRESH)
            .every(Duration::from_secs(24 * 3600))
            .with_retry_policy(exponential(3, 30, 600)),
        TaskDefinition::new(FOLLOW_UP_REMINDERS)
            .every(Duration::from_secs(3600))
            .with_retry_policy(exponential(5, 30, 600)),
        TaskDefinition::new(SNOOZE_EXPIRATION)
            .every(Duration::from_secs(30 * 60))
            .with_retry_policy(exponential(3, 10, 120)),
        TaskDefinition::new(AGENT_PERFORMANCE)
            .every(Duration::from_secs(3600))
            .with_retry_policy(exponential(3, 30, 600)),
        TaskDefinition::new(MODEL_TRAINING)
            .with_retry_policy(RetryPolicy::once())
            .with_idempotency(IdempotencyClass::NotSafeToRepeat)
            .with_basis(ScheduleBasis::LastAttempt),
        TaskDefinition::new(CALENDAR_INVITE).with_retry_policy(exponential(3, 30, 600)),
    ]
}

pub fn standard_registry() -> Result<TaskRegistry, SchedulerError> {
    let mut registry = TaskRegistry::new();
    for def in standard_definitions() {
        registry.register(def)?;
    }
    Ok(registry)
}

/// Everything the job bodies read or write.
#[derive(Clone)]
pub struct JobDeps {
    pub leads: Arc<dyn LeadRepository>,
    pub agents: Arc<dyn AgentDirectory>,
    pub interactions: Arc<dyn InteractionLog>,
    pub performance: Arc<dyn PerformanceStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub scorer: Arc<LeadScorer>,
    pub trainer: Arc<Trainer>,
}

/// Register a handler for every standard task.
pub fn register_handlers(builder: TaskExecutorBuilder, deps: &JobDeps) -> TaskExecutorBuilder {
    let d = deps.clone();
    let builder = builder.register_handler(SCORE_REFRESH, move |ctx| {
        JobError::into_job_result(score_refresh::refresh_scores(
            d.leads.as_ref(),
            &d.scorer,
            Utc::now(),
            ctx.cancellation_token(),
        ))
    });

    let d = deps.clone();
    let builder = builder.register_handler(FOLLOW_UP_REMINDERS, move |ctx| {
        JobError::into_job_result(follow_up::send_due_reminders(
            d.leads.as_ref(),
            d.agents.as_ref(),
            d.notifications.as_ref(),
            Utc::now(),
            ctx.cancellation_token(),
        ))
    });

    let d = deps.clone();
    let builder = builder.register_handler(SNOOZE_EXPIRATION, move |ctx| {
        JobError::into_job_result(snooze::expire_due(
            d.leads.as_ref(),
            Utc::now(),
            ctx.cancellation_token(),
        ))
    });

    let d = deps.clone();
    let builder = builder.register_handler(AGENT_PERFORMANCE, move |ctx| {
        JobError::into_job_result(performance::recompute_previous_day(
            &performance::PerformanceSources {
                leads: d.leads.as_ref(),
                agents: d.agents.as_ref(),
                interactions: d.interactions.as_ref(),
                store: d.performance.as_ref(),
            },
            Utc::now(),
            ctx.cancellation_token(),
        ))
    });

    let d = deps.clone();
    let builder = builder.register_handler(MODEL_TRAINING, move |_ctx| {
        JobError::into_job_result(training::train(d.leads.as_ref(), &d.trainer, Utc::now()))
    });

    let d = deps.clone();
    builder.register_handler(CALENDAR_INVITE, move |ctx| {
        JobError::into_job_result(
            calendar_invite::InviteRequest::from_payload(&ctx.payload).and_then(|request| {
                calendar_invite::send_invite(
                    d.leads.as_ref(),
                    d.agents.as_ref(),
                    d.notifications.as_ref(),
                    &request,
                    Utc::now(),
                )
            }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_matches_the_schedule() {
        let registry = standard_registry().unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec![
                SCORE_REFRESH,
                FOLLOW_UP_REMINDERS,
                SNOOZE_EXPIRATION,
                AGENT_PERFORMANCE,
                MODEL_TRAINING,
                CALENDAR_INVITE
            ]
        );

        let snooze = registry.get(SNOOZE_EXPIRATION).unwrap();
        assert_eq!(snooze.interval, Some(Duration::from_secs(1800)));
        assert_eq!(snooze.retry_policy.max_delay, Duration::from_secs(120));

        let reminders = registry.get(FOLLOW_UP_REMINDERS).unwrap();
        assert_eq!(reminders.retry_policy.max_attempts, 5);

        let training = registry.get(MODEL_TRAINING).unwrap();
        assert!(!training.is_periodic());
        assert_eq!(training.retry_policy.max_attempts, 1);
        assert_eq!(training.idempotency, IdempotencyClass::NotSafeToRepeat);

        let invite = registry.get(CALENDAR_INVITE).unwrap();
        assert!(!invite.is_periodic());
        assert_eq!(invite.retry_policy.max_attempts, 3);
        assert_eq!(invite.idempotency, IdempotencyClass::SafeToRepeat);
    }

    #[test]
    fn cancelled_bodies_map_to_cancelled_runs() {
        assert_eq!(
            JobError::into_job_result::<()>(Err(JobError::Cancelled)),
            JobResult::Cancelled
        );
        assert!(matches!(
            JobError::into_job_result::<()>(Err(JobError::Repository(RepositoryError::Storage(
                "down".into()
            )))),
            JobResult::Failure(msg) if msg.contains("down")
        ));
    }
}
