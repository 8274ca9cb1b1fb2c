//! Manual-trigger facade used by the CRUD/admin layer.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use leadflow_core::LeadId;
use leadflow_scoring::{
    FileModelStore, InMemoryModelStore, LeadScorer, ModelArtifact, ModelStore, ModelStoreError,
    ScoreOutcome, ScoringHealth, Trainer, TrainerConfig, TrainingError,
};

use crate::broker::BrokerProbe;
use crate::config::LeadflowConfig;
use crate::jobs::calendar_invite::InviteRequest;
use crate::jobs::{self, CALENDAR_INVITE, JobDeps, MODEL_TRAINING};
use crate::notify::NotificationSink;
use crate::repository::{
    AgentDirectory, InteractionLog, LeadRepository, PerformanceStore, RepositoryError,
};
use crate::tasks::{
    CancelOutcome, ExecutionMode, ExecutorError, ExecutorStats, SchedulerError, Submission,
    TaskExecutor, TaskRun, TaskRunFilter, TaskRunId, TaskRunStore, TaskRunStoreError,
    TaskScheduler,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    TaskRuns(#[from] TaskRunStoreError),
    #[error(transparent)]
    Models(#[from] ModelStoreError),
}

/// File-backed when a model directory is configured, in-memory otherwise.
pub fn open_model_store(config: &LeadflowConfig) -> Result<Arc<dyn ModelStore>, ServiceError> {
    match &config.model_dir {
        Some(dir) => {
            let store = FileModelStore::open(dir)?;
            info!(
                dir = %dir.display(),
                current = ?store.current().map(|a| a.version),
                "model store opened"
            );
            Ok(Arc::new(store))
        }
        None => Ok(InMemoryModelStore::arc()),
    }
}

/// Stores and collaborators the service is wired from.
#[derive(Clone)]
pub struct ServiceDeps {
    pub leads: Arc<dyn LeadRepository>,
    pub agents: Arc<dyn AgentDirectory>,
    pub interactions: Arc<dyn InteractionLog>,
    pub performance: Arc<dyn PerformanceStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub models: Arc<dyn ModelStore>,
    pub task_runs: Arc<dyn TaskRunStore>,
}

pub struct LeadScoringService {
    leads: Arc<dyn LeadRepository>,
    scorer: Arc<LeadScorer>,
    trainer: Arc<Trainer>,
    executor: Arc<TaskExecutor>,
    scheduler: Arc<TaskScheduler>,
}

impl LeadScoringService {
    /// Wire scoring, the standard tasks, and the executor.
    ///
    /// `probe` is consulted once here to pick the execution mode for the
    /// lifetime of the service.
    pub fn build(
        deps: ServiceDeps,
        config: &LeadflowConfig,
        probe: &dyn BrokerProbe,
    ) -> Result<Self, ServiceError> {
        let mut registry = jobs::standard_registry()?;
        registry.apply_interval_overrides(&config.task_intervals)?;

        let scorer = Arc::new(
            LeadScorer::new(deps.models.clone()).with_failure_threshold(config.model_failure_threshold),
        );
        let trainer = Arc::new(Trainer::new(
            deps.models.clone(),
            TrainerConfig {
                min_samples: config.min_training_samples,
                ..Default::default()
            },
        ));

        let job_deps = JobDeps {
            leads: deps.leads.clone(),
            agents: deps.agents,
            interactions: deps.interactions,
            performance: deps.performance,
            notifications: deps.notifications,
            scorer: scorer.clone(),
            trainer: trainer.clone(),
        };
        let builder = jobs::register_handlers(TaskExecutor::builder(deps.task_runs), &job_deps);
        let executor = Arc::new(builder.build(&config.executor_config(), probe));
        let scheduler = Arc::new(TaskScheduler::new(
            registry,
            executor.clone(),
            config.scheduler_config(),
        ));

        info!(mode = %executor.mode(), "lead scoring service ready");
        Ok(Self {
            leads: deps.leads,
            scorer,
            trainer,
            executor,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Train now, in the caller's thread, and return the published artifact.
    pub fn train_model(&self) -> Result<Arc<ModelArtifact>, ServiceError> {
        let history = self.leads.snapshots()?;
        Ok(self.trainer.train(&history, Utc::now())?)
    }

    /// Submit a training run. Completes before returning in inline mode.
    pub fn schedule_training(&self) -> Result<Submission, ServiceError> {
        self.run_task_now(MODEL_TRAINING)
    }

    /// Submit a meeting invitation for the lead and agent in `request`.
    pub fn send_calendar_invite(&self, request: &InviteRequest) -> Result<Submission, ServiceError> {
        Ok(self.scheduler.run_now_with(CALENDAR_INVITE, request.to_payload())?)
    }

    /// Score a lead with the current model and store the result on it.
    pub fn score_lead(&self, id: LeadId) -> Result<ScoreOutcome, ServiceError> {
        let lead = self.leads.get(id)?.ok_or(ServiceError::LeadNotFound(id))?;
        let outcome = self.scorer.score(&lead.snapshot(), Utc::now());
        self.leads.update(id, &mut |l| l.set_score(outcome.score))?;
        Ok(outcome)
    }

    /// Write-path hook: rescore a lead after it was created or edited.
    pub fn on_lead_saved(&self, id: LeadId) -> Result<ScoreOutcome, ServiceError> {
        let outcome = self.score_lead(id)?;
        debug!(lead_id = %id, score = %outcome.score, "lead rescored on save");
        Ok(outcome)
    }

    pub fn list_task_runs(&self, filter: &TaskRunFilter) -> Result<Vec<TaskRun>, ServiceError> {
        Ok(self.executor.store().list(filter)?)
    }

    pub fn cancel_task_run(&self, id: TaskRunId) -> Result<CancelOutcome, ServiceError> {
        Ok(self.executor.cancel(id)?)
    }

    pub fn run_task_now(&self, name: &str) -> Result<Submission, ServiceError> {
        Ok(self.scheduler.run_now(name)?)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    pub fn scoring_health(&self) -> ScoringHealth {
        self.scorer.health()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StaticBrokerProbe;
    use crate::notify::InMemoryNotificationSink;
    use crate::repository::{
        InMemoryAgentDirectory, InMemoryInteractionLog, InMemoryLeadRepository,
        InMemoryPerformanceStore,
    };
    use crate::tasks::InMemoryTaskRunStore;
    use leadflow_core::OrganisationId;
    use leadflow_leads::{EngagementLevel, Lead};

    fn service(leads: Arc<InMemoryLeadRepository>) -> LeadScoringService {
        let deps = ServiceDeps {
            leads,
            agents: Arc::new(InMemoryAgentDirectory::new()),
            interactions: Arc::new(InMemoryInteractionLog::new()),
            performance: Arc::new(InMemoryPerformanceStore::new()),
            notifications: InMemoryNotificationSink::arc(),
            models: InMemoryModelStore::arc(),
            task_runs: InMemoryTaskRunStore::arc(),
        };
        LeadScoringService::build(deps, &LeadflowConfig::default(), &StaticBrokerProbe::unavailable())
            .unwrap()
    }

    #[test]
    fn score_lead_stores_the_score() {
        let lead = Lead::new(OrganisationId::new(), "Edsger", "Dijkstra", "e@example.com", Utc::now())
            .with_engagement(EngagementLevel::Medium);
        let id = lead.id();
        let leads = Arc::new(InMemoryLeadRepository::with_leads([lead]));
        let svc = service(leads.clone());

        let outcome = svc.on_lead_saved(id).unwrap();
        assert!(outcome.source.is_fallback());
        assert_eq!(leads.get(id).unwrap().unwrap().score(), outcome.score);
        assert_eq!(svc.scoring_health().active_version, None);

        let missing = LeadId::new();
        assert_eq!(svc.score_lead(missing).unwrap_err(), ServiceError::LeadNotFound(missing));
    }

    #[test]
    fn model_store_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = LeadflowConfig {
            model_dir: Some(dir.path().join("models")),
            ..Default::default()
        };
        let store = open_model_store(&config).unwrap();
        assert!(store.current().is_none());
        assert!(dir.path().join("models").join("artifacts").is_dir());

        let in_memory = open_model_store(&LeadflowConfig::default()).unwrap();
        assert!(in_memory.history().is_empty());
    }

    #[test]
    fn training_without_data_is_insufficient() {
        let svc = service(InMemoryLeadRepository::arc());
        assert!(matches!(
            svc.train_model(),
            Err(ServiceError::Training(TrainingError::InsufficientData { labeled: 0, required: 50 }))
        ));
        assert_eq!(svc.execution_mode(), ExecutionMode::Inline);
        assert!(matches!(
            svc.run_task_now("not-a-task"),
            Err(ServiceError::Scheduler(SchedulerError::UnknownTask(_)))
        ));
    }
}
