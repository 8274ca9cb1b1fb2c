//! Outbound notifications (follow-up reminders and meeting invitations).
//!
//! Delivery transport is external; [`NotificationSink`] is the capability the
//! follow-up job consumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use leadflow_core::LeadId;

pub const CALENDAR_CONTENT_TYPE: &str = "text/calendar";

/// Length of the calendar event attached to a reminder.
pub const REMINDER_EVENT_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub calendar_attachment: Option<CalendarAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationDeliveryError {
    #[error("notification transport unreachable: {0}")]
    Unreachable(String),
    #[error("notification to {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },
}

pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), NotificationDeliveryError>;
}

/// Records notifications instead of delivering them. Can be switched into a
/// failing mode to exercise retries.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn send(&self, notification: &Notification) -> Result<(), NotificationDeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationDeliveryError::Unreachable("sink offline".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        Ok(())
    }
}

/// Writes notifications to the log. Stand-in transport for the worker binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn send(&self, notification: &Notification) -> Result<(), NotificationDeliveryError> {
        info!(
            recipient = %notification.recipient,
            subject = %notification.subject,
            has_calendar = notification.calendar_attachment.is_some(),
            "notification dispatched"
        );
        Ok(())
    }
}

/// One-event iCalendar document for a follow-up at `start`.
pub fn follow_up_calendar(
    lead_id: LeadId,
    lead_name: &str,
    start: DateTime<Utc>,
    notes: Option<&str>,
    stamp: DateTime<Utc>,
) -> CalendarAttachment {
    let content = CalendarEvent {
        product: "follow-up reminders",
        uid: format!("{lead_id}-{}@leadflow", start.timestamp()),
        start,
        end: start + Duration::minutes(REMINDER_EVENT_MINUTES),
        summary: format!("Follow up with {lead_name}"),
        description: notes,
        attendees: &[],
        stamp,
    }
    .render();

    CalendarAttachment {
        filename: format!("follow-up-{lead_id}.ics"),
        content_type: CALENDAR_CONTENT_TYPE.to_string(),
        content,
    }
}

/// A meeting between a lead and their agent.
#[derive(Debug, Clone, Copy)]
pub struct MeetingInvite<'a> {
    pub lead_id: LeadId,
    pub lead_name: &'a str,
    pub lead_email: &'a str,
    pub agent_name: &'a str,
    pub agent_email: &'a str,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
}

/// One-event iCalendar document for a meeting, listing both parties as
/// attendees. The UID depends only on the lead and start time, so a resent
/// invitation updates the same calendar entry.
pub fn meeting_calendar(invite: &MeetingInvite<'_>, stamp: DateTime<Utc>) -> CalendarAttachment {
    let lead_id = invite.lead_id;
    let description = format!("Meeting between {} and {}", invite.agent_name, invite.lead_name);
    let content = CalendarEvent {
        product: "meeting invitations",
        uid: format!("meeting-{lead_id}-{}@leadflow", invite.start.timestamp()),
        start: invite.start,
        end: invite.start + Duration::minutes(i64::from(invite.duration_minutes)),
        summary: format!("Meeting with {}", invite.lead_name),
        description: Some(description.as_str()),
        attendees: &[
            (invite.lead_name, invite.lead_email),
            (invite.agent_name, invite.agent_email),
        ],
        stamp,
    }
    .render();

    CalendarAttachment {
        filename: format!("meeting-{lead_id}.ics"),
        content_type: CALENDAR_CONTENT_TYPE.to_string(),
        content,
    }
}

struct CalendarEvent<'a> {
    product: &'a str,
    uid: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    summary: String,
    description: Option<&'a str>,
    attendees: &'a [(&'a str, &'a str)],
    stamp: DateTime<Utc>,
}

impl CalendarEvent<'_> {
    fn render(&self) -> String {
        const FMT: &str = "%Y%m%dT%H%M%SZ";
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:-//leadflow//{}//EN", self.product),
            "BEGIN:VEVENT".to_string(),
            format!("UID:{}", self.uid),
            format!("DTSTAMP:{}", self.stamp.format(FMT)),
            format!("DTSTART:{}", self.start.format(FMT)),
            format!("DTEND:{}", self.end.format(FMT)),
            format!("SUMMARY:{}", escape_text(&self.summary)),
        ];
        if let Some(description) = self.description.filter(|d| !d.trim().is_empty()) {
            lines.push(format!("DESCRIPTION:{}", escape_text(description)));
        }
        for (name, email) in self.attendees {
            lines.push(format!(
                "ATTENDEE;CN=\"{}\";RSVP=TRUE:mailto:{email}",
                name.replace('"', "")
            ));
        }
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut content = lines.join("\r\n");
        content.push_str("\r\n");
        content
    }
}

// RFC 5545 TEXT escaping.
fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn calendar_event_spans_thirty_minutes() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let cal = follow_up_calendar(
            LeadId::new(),
            "Grace Hopper",
            start,
            Some("Call back; ask about budget, timeline"),
            start,
        );

        assert_eq!(cal.content_type, "text/calendar");
        assert!(cal.filename.ends_with(".ics"));
        assert!(cal.content.contains("DTSTART:20250602T140000Z\r\n"));
        assert!(cal.content.contains("DTEND:20250602T143000Z\r\n"));
        assert!(cal.content.contains("SUMMARY:Follow up with Grace Hopper"));
        assert!(cal.content.contains("DESCRIPTION:Call back\\; ask about budget\\, timeline"));
        assert_eq!(cal.content.matches("BEGIN:VEVENT").count(), 1);
    }

    #[test]
    fn meeting_invite_lists_both_attendees() {
        let start = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let lead_id = LeadId::new();
        let invite = MeetingInvite {
            lead_id,
            lead_name: "Grace Hopper",
            lead_email: "grace@example.com",
            agent_name: "Joan Clarke",
            agent_email: "joan@example.com",
            start,
            duration_minutes: 45,
        };

        let cal = meeting_calendar(&invite, start);
        assert!(cal.content.contains("DTSTART:20250602T140000Z\r\n"));
        assert!(cal.content.contains("DTEND:20250602T144500Z\r\n"));
        assert!(cal.content.contains("SUMMARY:Meeting with Grace Hopper"));
        assert!(cal.content.contains("ATTENDEE;CN=\"Grace Hopper\";RSVP=TRUE:mailto:grace@example.com\r\n"));
        assert!(cal.content.contains("ATTENDEE;CN=\"Joan Clarke\";RSVP=TRUE:mailto:joan@example.com\r\n"));

        let resent = meeting_calendar(&invite, start + Duration::hours(1));
        let uid = |c: &str| c.lines().find(|l| l.starts_with("UID:")).map(str::to_string);
        assert_eq!(uid(&cal.content), uid(&resent.content));
        assert_ne!(uid(&cal.content), uid(&follow_up_calendar(lead_id, "Grace Hopper", start, None, start).content));
    }

    #[test]
    fn in_memory_sink_can_fail() {
        let sink = InMemoryNotificationSink::new();
        let n = Notification {
            recipient: "agent@example.com".into(),
            subject: "s".into(),
            body: "b".into(),
            calendar_attachment: None,
        };

        sink.send(&n).unwrap();
        sink.set_failing(true);
        assert!(matches!(sink.send(&n), Err(NotificationDeliveryError::Unreachable(_))));
        assert_eq!(sink.sent(), vec![n]);
    }
}
