//! Agent performance rollups.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use leadflow_leads::{AgentPerformanceSnapshot, ReportingPeriod};

use crate::repository::{AgentDirectory, InteractionLog, LeadRepository, PerformanceStore};
use crate::tasks::CancellationToken;

use super::JobError;

/// Where a recomputation reads from and writes to.
pub struct PerformanceSources<'a> {
    pub leads: &'a dyn LeadRepository,
    pub agents: &'a dyn AgentDirectory,
    pub interactions: &'a dyn InteractionLog,
    pub store: &'a dyn PerformanceStore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub period: ReportingPeriod,
    pub agents: usize,
}

/// Recompute and overwrite the snapshot of every active agent for `period`.
pub fn recompute(
    sources: &PerformanceSources<'_>,
    period: ReportingPeriod,
    cancel: &CancellationToken,
) -> Result<PerformanceReport, JobError> {
    let leads = sources.leads.snapshots()?;
    let interactions = sources.interactions.in_period(&period)?;

    let mut agents = 0;
    for agent in sources.agents.active()? {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let snapshot = AgentPerformanceSnapshot::compute(agent.id, period, &leads, &interactions);
        sources.store.upsert(snapshot)?;
        agents += 1;
    }

    info!(period_start = %period.start, agents, "agent performance recomputed");
    Ok(PerformanceReport { period, agents })
}

/// The periodic job covers the previous UTC day.
pub fn recompute_previous_day(
    sources: &PerformanceSources<'_>,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<PerformanceReport, JobError> {
    recompute(sources, ReportingPeriod::previous_day(now), cancel)
}
