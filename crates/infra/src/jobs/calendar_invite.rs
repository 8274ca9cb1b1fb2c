//! On-demand meeting invitations.
//!
//! The lead and the agent each receive the same calendar event. A retried
//! run sends both again; the event UID is stable, so calendars update the
//! existing entry instead of adding a second one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use leadflow_core::{AgentId, LeadId};

use crate::notify::{MeetingInvite, Notification, NotificationSink, meeting_calendar};
use crate::repository::{AgentDirectory, LeadRepository, RepositoryError};

use super::JobError;

pub const DEFAULT_MEETING_MINUTES: u32 = 60;

/// Arguments of a `calendar-invite` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRequest {
    pub lead_id: LeadId,
    pub agent_id: AgentId,
    pub start: DateTime<Utc>,
    #[serde(default = "default_minutes")]
    pub duration_minutes: u32,
}

fn default_minutes() -> u32 {
    DEFAULT_MEETING_MINUTES
}

impl InviteRequest {
    pub fn new(lead_id: LeadId, agent_id: AgentId, start: DateTime<Utc>) -> Self {
        Self {
            lead_id,
            agent_id,
            start,
            duration_minutes: DEFAULT_MEETING_MINUTES,
        }
    }

    pub fn lasting(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    pub fn from_payload(payload: &JsonValue) -> Result<Self, JobError> {
        let request: Self = serde_json::from_value(payload.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        if request.duration_minutes == 0 {
            return Err(JobError::InvalidPayload("duration_minutes must be positive".into()));
        }
        Ok(request)
    }

    pub fn to_payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InviteReport {
    pub recipients: Vec<String>,
}

pub fn send_invite(
    leads: &dyn LeadRepository,
    agents: &dyn AgentDirectory,
    sink: &dyn NotificationSink,
    request: &InviteRequest,
    now: DateTime<Utc>,
) -> Result<InviteReport, JobError> {
    let lead = leads
        .get(request.lead_id)?
        .ok_or(RepositoryError::LeadNotFound(request.lead_id))?;
    let agent = agents
        .get(request.agent_id)?
        .ok_or(JobError::AgentNotFound(request.agent_id))?;

    let lead_name = lead.full_name();
    let invite = MeetingInvite {
        lead_id: lead.id(),
        lead_name: &lead_name,
        lead_email: &lead.email,
        agent_name: &agent.name,
        agent_email: &agent.email,
        start: request.start,
        duration_minutes: request.duration_minutes,
    };
    let calendar = meeting_calendar(&invite, now);
    let when = request.start.format("%Y-%m-%d %H:%M UTC");

    let messages = [
        (
            lead.email.clone(),
            format!(
                "Hi {},\n\n{} has invited you to a {}-minute meeting on {when}.\n",
                lead.first_name, agent.name, request.duration_minutes
            ),
        ),
        (
            agent.email.clone(),
            format!(
                "Hi {},\n\nYour {}-minute meeting with {lead_name} ({}) is booked for {when}.\n",
                agent.name, request.duration_minutes, lead.email
            ),
        ),
    ];

    let mut report = InviteReport::default();
    for (recipient, body) in messages {
        let notification = Notification {
            recipient: recipient.clone(),
            subject: format!("Meeting Invitation: {lead_name}"),
            body,
            calendar_attachment: Some(calendar.clone()),
        };
        if let Err(source) = sink.send(&notification) {
            warn!(lead_id = %request.lead_id, recipient = %recipient, error = %source, "meeting invitation not delivered");
            return Err(JobError::Delivery {
                failed: 1,
                lead_id: request.lead_id,
                source,
            });
        }
        report.recipients.push(recipient);
    }

    info!(lead_id = %request.lead_id, agent_id = %request.agent_id, start = %request.start, "meeting invitation sent");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::InMemoryNotificationSink;
    use crate::repository::{InMemoryAgentDirectory, InMemoryLeadRepository};
    use chrono::TimeZone;
    use leadflow_core::OrganisationId;
    use leadflow_leads::{Agent, Lead};

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 12, 0, 0).unwrap()
    }

    fn fixture() -> (InMemoryLeadRepository, InMemoryAgentDirectory, InviteRequest) {
        let agents = InMemoryAgentDirectory::new();
        let agent = Agent::new(OrganisationId::new(), "Joan Clarke", "joan@example.com");
        agents.insert(agent.clone()).unwrap();
        let leads = InMemoryLeadRepository::new();
        let lead = Lead::new(agent.organisation_id, "Ada", "Lovelace", "ada@example.com", t())
            .with_agent(agent.id);
        let request = InviteRequest::new(lead.id(), agent.id, t() + chrono::Duration::days(2)).lasting(30);
        leads.save(lead).unwrap();
        (leads, agents, request)
    }

    #[test]
    fn invitation_goes_to_lead_and_agent() {
        let (leads, agents, request) = fixture();
        let sink = InMemoryNotificationSink::new();

        let report = send_invite(&leads, &agents, &sink, &request, t()).unwrap();
        assert_eq!(report.recipients, vec!["ada@example.com", "joan@example.com"]);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        for n in &sent {
            assert_eq!(n.subject, "Meeting Invitation: Ada Lovelace");
            let cal = n.calendar_attachment.as_ref().unwrap();
            assert!(cal.content.contains("DTSTART:20250412T120000Z"));
            assert!(cal.content.contains("DTEND:20250412T123000Z"));
            assert!(cal.content.contains("mailto:ada@example.com"));
            assert!(cal.content.contains("mailto:joan@example.com"));
        }
        assert!(sent[0].body.contains("Joan Clarke has invited you"));
        assert!(sent[1].body.contains("meeting with Ada Lovelace"));
    }

    #[test]
    fn resending_keeps_the_same_event() {
        let (leads, agents, request) = fixture();
        let sink = InMemoryNotificationSink::new();

        send_invite(&leads, &agents, &sink, &request, t()).unwrap();
        send_invite(&leads, &agents, &sink, &request, t() + chrono::Duration::minutes(5)).unwrap();

        let uids: Vec<String> = sink
            .sent()
            .iter()
            .filter_map(|n| n.calendar_attachment.as_ref())
            .filter_map(|c| c.content.lines().find(|l| l.starts_with("UID:")).map(str::to_string))
            .collect();
        assert_eq!(uids.len(), 4);
        assert!(uids.iter().all(|u| u == &uids[0]));
    }

    #[test]
    fn unknown_agent_and_delivery_failure_are_errors() {
        let (leads, agents, request) = fixture();
        let sink = InMemoryNotificationSink::new();

        let stranger = AgentId::new();
        let missing = InviteRequest { agent_id: stranger, ..request.clone() };
        assert_eq!(
            send_invite(&leads, &agents, &sink, &missing, t()),
            Err(JobError::AgentNotFound(stranger))
        );

        sink.set_failing(true);
        assert!(matches!(
            send_invite(&leads, &agents, &sink, &request, t()),
            Err(JobError::Delivery { failed: 1, .. })
        ));
    }

    #[test]
    fn payload_defaults_duration_and_rejects_garbage() {
        let (_, _, request) = fixture();
        let mut payload = request.to_payload();
        payload.as_object_mut().unwrap().remove("duration_minutes");

        let parsed = InviteRequest::from_payload(&payload).unwrap();
        assert_eq!(parsed.duration_minutes, DEFAULT_MEETING_MINUTES);
        assert_eq!(parsed.lead_id, request.lead_id);

        assert!(matches!(
            InviteRequest::from_payload(&JsonValue::Null),
            Err(JobError::InvalidPayload(_))
        ));
        assert!(matches!(
            InviteRequest::from_payload(&request.clone().lasting(0).to_payload()),
            Err(JobError::InvalidPayload(_))
        ));
    }
}
