use serde::{Deserialize, Serialize};

use leadflow_core::{AgentId, OrganisationId};

/// A sales agent that leads can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub organisation_id: OrganisationId,
    pub name: String,
    pub email: String,
    pub is_active: bool,
}

impl Agent {
    pub fn new(
        organisation_id: OrganisationId,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id: AgentId::new(),
            organisation_id,
            name: name.into(),
            email: email.into(),
            is_active: true,
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}
