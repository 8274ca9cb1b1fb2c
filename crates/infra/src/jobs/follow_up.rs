//! Follow-up reminder dispatch.
//!
//! Exactly one reminder per (lead, follow-up date). The marker is reserved
//! before sending and rolled back if delivery fails, so a retried run sends
//! what was missed and nothing twice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use leadflow_leads::{Agent, Lead};

use crate::notify::{Notification, NotificationDeliveryError, NotificationSink, follow_up_calendar};
use crate::repository::{AgentDirectory, LeadRepository, RepositoryError};
use crate::tasks::CancellationToken;

use super::JobError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub examined: usize,
    pub sent: usize,
    /// Due, but the lead has no (known) agent to notify.
    pub skipped_no_recipient: usize,
    pub failed: usize,
}

/// Notify the owning agent of every lead whose follow-up is due.
///
/// A delivery failure does not stop the pass; the run fails at the end so
/// the executor retries the undelivered reminders.
pub fn send_due_reminders(
    leads: &dyn LeadRepository,
    agents: &dyn AgentDirectory,
    sink: &dyn NotificationSink,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<ReminderReport, JobError> {
    let mut report = ReminderReport::default();
    let mut first_failure: Option<(leadflow_core::LeadId, NotificationDeliveryError)> = None;

    for id in leads.ids()? {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let Some(lead) = leads.get(id)? else {
            continue;
        };
        report.examined += 1;

        let Some(date) = lead.follow_up_date().filter(|_| lead.reminder_due(now)) else {
            continue;
        };
        let agent = match lead.agent_id() {
            Some(agent_id) => agents.get(agent_id)?,
            None => None,
        };
        let Some(agent) = agent else {
            debug!(lead_id = %id, "follow-up due but no agent to notify");
            report.skipped_no_recipient += 1;
            continue;
        };

        // Reserve the marker; another pass may have got here first.
        let mut reserved = false;
        let current = match leads.update(id, &mut |l| {
            if l.reminder_due(now) && l.follow_up_date() == Some(date) {
                l.mark_reminded(date);
                reserved = true;
            }
        }) {
            Ok(lead) => lead,
            Err(RepositoryError::LeadNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        if !reserved {
            continue;
        }

        let notification = reminder_notification(&current, &agent, date, now);
        match sink.send(&notification) {
            Ok(()) => {
                debug!(lead_id = %id, recipient = %agent.email, "follow-up reminder sent");
                report.sent += 1;
            }
            Err(e) => {
                warn!(lead_id = %id, error = %e, "follow-up reminder not delivered");
                leads.update(id, &mut |l| l.clear_reminder_marker(date))?;
                report.failed += 1;
                first_failure.get_or_insert((id, e));
            }
        }
    }

    if let Some((lead_id, source)) = first_failure {
        return Err(JobError::Delivery {
            failed: report.failed,
            lead_id,
            source,
        });
    }

    info!(
        examined = report.examined,
        sent = report.sent,
        skipped = report.skipped_no_recipient,
        "follow-up reminder pass complete"
    );
    Ok(report)
}

pub fn reminder_notification(
    lead: &Lead,
    agent: &Agent,
    date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Notification {
    let name = lead.full_name();
    let mut body = format!(
        "Hi {},\n\nYou have a follow-up scheduled with {} ({}) on {}.\n",
        agent.name,
        name,
        lead.email,
        date.format("%Y-%m-%d %H:%M UTC"),
    );
    if lead.is_follow_up_overdue(now) {
        body.push_str("This follow-up is OVERDUE.\n");
    }
    let notes = lead.follow_up_notes.as_deref();
    body.push_str(&format!("\nNotes: {}\n", notes.unwrap_or("none")));

    Notification {
        recipient: agent.email.clone(),
        subject: format!("Follow-up reminder: {name}"),
        body,
        calendar_attachment: Some(follow_up_calendar(lead.id(), &name, date, notes, now)),
    }
}
