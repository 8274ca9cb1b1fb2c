use std::sync::Arc;

use anyhow::Context;

use leadflow_infra::notify::TracingNotificationSink;
use leadflow_infra::repository::{
    InMemoryAgentDirectory, InMemoryInteractionLog, InMemoryLeadRepository,
    InMemoryPerformanceStore,
};
use leadflow_infra::tasks::{InMemoryTaskRunStore, SchedulerLoop};
use leadflow_infra::{LeadScoringService, LeadflowConfig, ServiceDeps, open_model_store, probe_for};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    leadflow_observability::init();

    let config = LeadflowConfig::from_env().context("invalid LEADFLOW_* configuration")?;
    let models = open_model_store(&config).context("failed to open model store")?;

    let deps = ServiceDeps {
        leads: InMemoryLeadRepository::arc(),
        agents: Arc::new(InMemoryAgentDirectory::new()),
        interactions: Arc::new(InMemoryInteractionLog::new()),
        performance: Arc::new(InMemoryPerformanceStore::new()),
        notifications: Arc::new(TracingNotificationSink),
        models,
        task_runs: InMemoryTaskRunStore::arc(),
    };
    let probe = probe_for(&config);
    let service = LeadScoringService::build(deps, &config, probe.as_ref())
        .context("failed to build lead scoring service")?;

    let scheduler = SchedulerLoop::spawn(service.scheduler().clone());
    tracing::info!(
        mode = %service.execution_mode(),
        tick_secs = config.tick_interval.as_secs(),
        "leadflow worker running; Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");

    // Joining threads blocks; keep it off the async workers.
    tokio::task::spawn_blocking(move || {
        scheduler.shutdown();
        service.shutdown();
        let stats = service.executor_stats();
        tracing::info!(
            processed = stats.runs_processed,
            succeeded = stats.runs_succeeded,
            failed = stats.runs_failed,
            "worker stopped"
        );
    })
    .await
    .context("shutdown task panicked")?;

    Ok(())
}
