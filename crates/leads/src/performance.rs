use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::AgentId;

use crate::interaction::Interaction;
use crate::lead::{LeadOutcome, LeadSnapshot};

/// Half-open time window `[start, end)` a performance snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The UTC calendar day `date`.
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    /// The UTC day before the one containing `now`.
    pub fn previous_day(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self::day(today.pred_opt().unwrap_or(today))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Agent-level rollup for one reporting period.
///
/// Always recomputed wholesale from the leads/interactions in scope, never
/// incrementally patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformanceSnapshot {
    pub agent_id: AgentId,
    pub period: ReportingPeriod,
    pub leads_assigned: u32,
    pub leads_contacted: u32,
    pub leads_converted: u32,
    pub total_interactions: u32,
    pub average_interaction_hours: f64,
    /// contacted / assigned, 0 when nothing was assigned.
    pub contact_rate: f64,
    /// converted / assigned, 0 when nothing was assigned.
    pub conversion_rate: f64,
}

impl AgentPerformanceSnapshot {
    pub fn compute(
        agent_id: AgentId,
        period: ReportingPeriod,
        leads: &[LeadSnapshot],
        interactions: &[Interaction],
    ) -> Self {
        let owned = leads.iter().filter(|l| l.agent_id == Some(agent_id));

        let mut leads_assigned = 0u32;
        let mut leads_contacted = 0u32;
        let mut leads_converted = 0u32;
        for lead in owned {
            if period.contains(lead.created_at) {
                leads_assigned += 1;
            }
            if lead.last_contacted.is_some_and(|t| period.contains(t)) {
                leads_contacted += 1;
            }
            if lead.outcome == Some(LeadOutcome::Converted)
                && lead.closed_at.is_some_and(|t| period.contains(t))
            {
                leads_converted += 1;
            }
        }

        let in_period: Vec<&Interaction> = interactions
            .iter()
            .filter(|i| i.agent_id == agent_id && period.contains(i.occurred_at))
            .collect();
        let total_interactions = in_period.len() as u32;
        let average_interaction_hours = if in_period.is_empty() {
            0.0
        } else {
            let minutes: u64 = in_period.iter().map(|i| i.duration_minutes as u64).sum();
            minutes as f64 / in_period.len() as f64 / 60.0
        };

        Self {
            agent_id,
            period,
            leads_assigned,
            leads_contacted,
            leads_converted,
            total_interactions,
            average_interaction_hours,
            contact_rate: rate(leads_contacted, leads_assigned),
            conversion_rate: rate(leads_converted, leads_assigned),
        }
    }
}

// Contacts/conversions may come from leads assigned in earlier periods, so the
// ratio is capped at 1.
fn rate(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64).min(1.0)
}
