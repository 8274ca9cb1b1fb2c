//! Record stores the job bodies read and write.
//!
//! The lead/agent CRUD layer lives outside this system; these traits are the
//! narrow view of it the background jobs need, with in-memory implementations
//! for the worker binary and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use leadflow_core::{AgentId, LeadId};
use leadflow_leads::{Agent, AgentPerformanceSnapshot, Interaction, Lead, LeadSnapshot, ReportingPeriod};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait LeadRepository: Send + Sync {
    fn get(&self, id: LeadId) -> Result<Option<Lead>, RepositoryError>;

    /// Insert or replace.
    fn save(&self, lead: Lead) -> Result<(), RepositoryError>;

    fn ids(&self) -> Result<Vec<LeadId>, RepositoryError>;

    fn snapshots(&self) -> Result<Vec<LeadSnapshot>, RepositoryError>;

    /// Read-modify-write of a single lead, atomic with respect to other
    /// writers of that lead. Returns the lead as written.
    fn update(&self, id: LeadId, f: &mut dyn FnMut(&mut Lead)) -> Result<Lead, RepositoryError>;
}

pub trait AgentDirectory: Send + Sync {
    fn get(&self, id: AgentId) -> Result<Option<Agent>, RepositoryError>;

    fn active(&self) -> Result<Vec<Agent>, RepositoryError>;
}

pub trait InteractionLog: Send + Sync {
    fn record(&self, interaction: Interaction) -> Result<(), RepositoryError>;

    fn in_period(&self, period: &ReportingPeriod) -> Result<Vec<Interaction>, RepositoryError>;
}

/// Snapshots keyed by (agent, period); writes overwrite.
pub trait PerformanceStore: Send + Sync {
    fn upsert(&self, snapshot: AgentPerformanceSnapshot) -> Result<(), RepositoryError>;

    fn get(
        &self,
        agent_id: AgentId,
        period: &ReportingPeriod,
    ) -> Result<Option<AgentPerformanceSnapshot>, RepositoryError>;

    fn list(&self) -> Result<Vec<AgentPerformanceSnapshot>, RepositoryError>;
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Storage("lock poisoned".to_string())
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, RepositoryError> {
    lock.read().map_err(poisoned)
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, RepositoryError> {
    lock.write().map_err(poisoned)
}

/// In-memory lead store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLeadRepository {
    inner: RwLock<HashMap<LeadId, Lead>>,
}

impl InMemoryLeadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_leads(leads: impl IntoIterator<Item = Lead>) -> Self {
        Self {
            inner: RwLock::new(leads.into_iter().map(|l| (l.id(), l)).collect()),
        }
    }
}

impl LeadRepository for InMemoryLeadRepository {
    fn get(&self, id: LeadId) -> Result<Option<Lead>, RepositoryError> {
        Ok(read(&self.inner)?.get(&id).cloned())
    }

    fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        write(&self.inner)?.insert(lead.id(), lead);
        Ok(())
    }

    fn ids(&self) -> Result<Vec<LeadId>, RepositoryError> {
        let mut ids: Vec<LeadId> = read(&self.inner)?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn snapshots(&self) -> Result<Vec<LeadSnapshot>, RepositoryError> {
        let mut out: Vec<LeadSnapshot> = read(&self.inner)?.values().map(Lead::snapshot).collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    fn update(&self, id: LeadId, f: &mut dyn FnMut(&mut Lead)) -> Result<Lead, RepositoryError> {
        let mut leads = write(&self.inner)?;
        let lead = leads.get_mut(&id).ok_or(RepositoryError::LeadNotFound(id))?;
        f(lead);
        Ok(lead.clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAgentDirectory {
    inner: RwLock<HashMap<AgentId, Agent>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Agent) -> Result<(), RepositoryError> {
        write(&self.inner)?.insert(agent.id, agent);
        Ok(())
    }
}

impl AgentDirectory for InMemoryAgentDirectory {
    fn get(&self, id: AgentId) -> Result<Option<Agent>, RepositoryError> {
        Ok(read(&self.inner)?.get(&id).cloned())
    }

    fn active(&self) -> Result<Vec<Agent>, RepositoryError> {
        let mut agents: Vec<Agent> = read(&self.inner)?
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryInteractionLog {
    inner: RwLock<Vec<Interaction>>,
}

impl InMemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InteractionLog for InMemoryInteractionLog {
    fn record(&self, interaction: Interaction) -> Result<(), RepositoryError> {
        write(&self.inner)?.push(interaction);
        Ok(())
    }

    fn in_period(&self, period: &ReportingPeriod) -> Result<Vec<Interaction>, RepositoryError> {
        Ok(read(&self.inner)?
            .iter()
            .filter(|i| period.contains(i.occurred_at))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPerformanceStore {
    inner: RwLock<HashMap<(AgentId, ReportingPeriod), AgentPerformanceSnapshot>>,
}

impl InMemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PerformanceStore for InMemoryPerformanceStore {
    fn upsert(&self, snapshot: AgentPerformanceSnapshot) -> Result<(), RepositoryError> {
        write(&self.inner)?.insert((snapshot.agent_id, snapshot.period), snapshot);
        Ok(())
    }

    fn get(
        &self,
        agent_id: AgentId,
        period: &ReportingPeriod,
    ) -> Result<Option<AgentPerformanceSnapshot>, RepositoryError> {
        Ok(read(&self.inner)?.get(&(agent_id, *period)).cloned())
    }

    fn list(&self) -> Result<Vec<AgentPerformanceSnapshot>, RepositoryError> {
        let mut out: Vec<AgentPerformanceSnapshot> = read(&self.inner)?.values().cloned().collect();
        out.sort_by(|a, b| a.period.start.cmp(&b.period.start).then(a.agent_id.cmp(&b.agent_id)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use leadflow_core::OrganisationId;

    #[test]
    fn update_is_visible_to_later_reads() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let lead = Lead::new(OrganisationId::new(), "Ada", "Lovelace", "ada@example.com", now);
        let id = lead.id();
        let repo = InMemoryLeadRepository::with_leads([lead]);

        let later = now + chrono::Duration::hours(1);
        let written = repo
            .update(id, &mut |l| l.snooze(later + chrono::Duration::hours(1), later).unwrap())
            .unwrap();
        assert!(written.is_snoozed());
        assert!(repo.get(id).unwrap().unwrap().is_snoozed());

        let missing = LeadId::new();
        assert_eq!(
            repo.update(missing, &mut |_| {}).unwrap_err(),
            RepositoryError::LeadNotFound(missing)
        );
    }

    #[test]
    fn only_active_agents_are_listed() {
        let org = OrganisationId::new();
        let dir = InMemoryAgentDirectory::new();
        let active = Agent::new(org, "A", "a@example.com");
        dir.insert(active.clone()).unwrap();
        dir.insert(Agent::new(org, "B", "b@example.com").deactivated()).unwrap();

        assert_eq!(dir.active().unwrap(), vec![active]);
    }
}
