use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{AgentId, InteractionId, LeadId};

/// Kind of contact made with a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Call,
    Email,
    Meeting,
    Message,
    Other,
}

/// A recorded contact between an agent and a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: InteractionId,
    pub lead_id: LeadId,
    pub agent_id: AgentId,
    pub kind: InteractionType,
    pub duration_minutes: u32,
    pub occurred_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(
        lead_id: LeadId,
        agent_id: AgentId,
        kind: InteractionType,
        duration_minutes: u32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InteractionId::new(),
            lead_id,
            agent_id,
            kind,
            duration_minutes,
            occurred_at,
        }
    }
}
