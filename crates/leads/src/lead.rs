use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{AgentId, DomainError, DomainResult, LeadId, OrganisationId};

use crate::interaction::InteractionType;

/// Priority score in \[0, 100\] estimating conversion likelihood.
///
/// A score is a cached, derived value: it is whatever the active scoring model
/// returned the last time the lead was scored.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    pub const MIN: Score = Score(0);
    pub const MAX: Score = Score(100);

    /// Values above 100 are clipped.
    pub fn new(value: u8) -> Self {
        Self(value.min(100))
    }

    /// Round and clip a raw score; non-finite input maps to zero.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Self::MIN;
        }
        Self(value.round().clamp(0.0, 100.0) as u8)
    }

    /// `round(probability * 100)`.
    pub fn from_probability(probability: f64) -> Self {
        Self::from_f64(probability * 100.0)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for Score {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How engaged a lead currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl EngagementLevel {
    /// Ordinal encoding used as a model feature.
    pub fn ordinal(self) -> u8 {
        match self {
            EngagementLevel::Low => 0,
            EngagementLevel::Medium => 1,
            EngagementLevel::High => 2,
        }
    }

    /// Engagement derived from the number of recorded interactions.
    pub fn from_interaction_count(count: u32) -> Self {
        match count {
            0..=2 => EngagementLevel::Low,
            3..=5 => EngagementLevel::Medium,
            _ => EngagementLevel::High,
        }
    }
}

/// Terminal outcome of a lead, used as the training label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadOutcome {
    Converted,
    Lost,
}

/// A prospective customer tracked through the sales pipeline.
///
/// Snooze and follow-up state is only mutated through methods so the
/// snooze invariant holds:
/// - `is_snoozed` implies `snooze_until` is set (and was in the future when set)
/// - `!is_snoozed` implies `snooze_until` is cleared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    id: LeadId,
    organisation_id: OrganisationId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub age: u32,
    /// Free-text acquisition channel ("website", "referral", ...).
    pub source: Option<String>,
    pub category: Option<String>,
    agent_id: Option<AgentId>,
    score: Score,
    engagement_level: EngagementLevel,
    interaction_count: u32,
    last_interaction_type: Option<InteractionType>,
    last_contacted: Option<DateTime<Utc>>,
    follow_up_date: Option<DateTime<Utc>>,
    pub follow_up_notes: Option<String>,
    /// The follow-up date a reminder was last dispatched for.
    last_reminded_for: Option<DateTime<Utc>>,
    is_snoozed: bool,
    snooze_until: Option<DateTime<Utc>>,
    outcome: Option<LeadOutcome>,
    closed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        organisation_id: OrganisationId,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LeadId::new(),
            organisation_id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            email: email.into(),
            age: 0,
            source: None,
            category: None,
            agent_id: None,
            score: Score::MIN,
            engagement_level: EngagementLevel::Low,
            interaction_count: 0,
            last_interaction_type: None,
            last_contacted: None,
            follow_up_date: None,
            follow_up_notes: None,
            last_reminded_for: None,
            is_snoozed: false,
            snooze_until: None,
            outcome: None,
            closed_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_engagement(mut self, level: EngagementLevel) -> Self {
        self.engagement_level = level;
        self
    }

    pub fn id(&self) -> LeadId {
        self.id
    }

    pub fn organisation_id(&self) -> OrganisationId {
        self.organisation_id
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
    }

    pub fn score(&self) -> Score {
        self.score
    }

    pub fn engagement_level(&self) -> EngagementLevel {
        self.engagement_level
    }

    pub fn interaction_count(&self) -> u32 {
        self.interaction_count
    }

    pub fn last_interaction_type(&self) -> Option<InteractionType> {
        self.last_interaction_type
    }

    pub fn last_contacted(&self) -> Option<DateTime<Utc>> {
        self.last_contacted
    }

    pub fn follow_up_date(&self) -> Option<DateTime<Utc>> {
        self.follow_up_date
    }

    pub fn last_reminded_for(&self) -> Option<DateTime<Utc>> {
        self.last_reminded_for
    }

    pub fn is_snoozed(&self) -> bool {
        self.is_snoozed
    }

    pub fn snooze_until(&self) -> Option<DateTime<Utc>> {
        self.snooze_until
    }

    pub fn outcome(&self) -> Option<LeadOutcome> {
        self.outcome
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn set_score(&mut self, score: Score) {
        self.score = score;
    }

    pub fn set_engagement(&mut self, level: EngagementLevel, now: DateTime<Utc>) {
        self.engagement_level = level;
        self.updated_at = now;
    }

    pub fn assign_agent(&mut self, agent_id: AgentId, now: DateTime<Utc>) {
        self.agent_id = Some(agent_id);
        self.updated_at = now;
    }

    pub fn unassign_agent(&mut self, now: DateTime<Utc>) {
        self.agent_id = None;
        self.updated_at = now;
    }

    /// Suppress the lead from active follow-up until `until`.
    pub fn snooze(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        if until <= now {
            return Err(DomainError::validation(
                "snooze_until must be in the future",
            ));
        }
        self.is_snoozed = true;
        self.snooze_until = Some(until);
        self.updated_at = now;
        Ok(())
    }

    pub fn unsnooze(&mut self, now: DateTime<Utc>) {
        self.is_snoozed = false;
        self.snooze_until = None;
        self.updated_at = now;
    }

    /// Clear an elapsed snooze. Returns `true` only if the lead changed.
    pub fn expire_snooze(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_snoozed {
            return false;
        }
        match self.snooze_until {
            Some(until) if until > now => false,
            // A snoozed lead without a deadline is repaired rather than left stuck.
            _ => {
                self.unsnooze(now);
                true
            }
        }
    }

    /// Set (or move) the follow-up date. A changed date re-arms the reminder,
    /// even when it moves back to a date that was already reminded.
    pub fn schedule_follow_up(
        &mut self,
        date: DateTime<Utc>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) {
        if self.follow_up_date != Some(date) {
            self.last_reminded_for = None;
        }
        self.follow_up_date = Some(date);
        self.follow_up_notes = notes;
        self.updated_at = now;
    }

    pub fn clear_follow_up(&mut self, now: DateTime<Utc>) {
        self.follow_up_date = None;
        self.follow_up_notes = None;
        self.last_reminded_for = None;
        self.updated_at = now;
    }

    /// The follow-up date fell on an earlier calendar day than `now`
    /// (regardless of whether a reminder went out).
    pub fn is_follow_up_overdue(&self, now: DateTime<Utc>) -> bool {
        self.follow_up_date
            .is_some_and(|d| d.date_naive() < now.date_naive())
    }

    /// A reminder should be dispatched for the current follow-up date.
    pub fn reminder_due(&self, now: DateTime<Utc>) -> bool {
        match self.follow_up_date {
            Some(date) => date <= now && !self.is_snoozed && self.last_reminded_for != Some(date),
            None => false,
        }
    }

    /// Record that a reminder went out for `date`.
    pub fn mark_reminded(&mut self, date: DateTime<Utc>) {
        self.last_reminded_for = Some(date);
    }

    /// Roll back a reminder marker, but only if it still refers to `date`.
    pub fn clear_reminder_marker(&mut self, date: DateTime<Utc>) {
        if self.last_reminded_for == Some(date) {
            self.last_reminded_for = None;
        }
    }

    /// Record a contact and recompute engagement from the interaction count.
    pub fn record_interaction(&mut self, kind: InteractionType, at: DateTime<Utc>) {
        self.interaction_count = self.interaction_count.saturating_add(1);
        self.last_interaction_type = Some(kind);
        if self.last_contacted.is_none_or(|prev| at > prev) {
            self.last_contacted = Some(at);
        }
        self.engagement_level = EngagementLevel::from_interaction_count(self.interaction_count);
        self.updated_at = at.max(self.updated_at);
    }

    pub fn close(&mut self, outcome: LeadOutcome, at: DateTime<Utc>) {
        self.outcome = Some(outcome);
        self.closed_at = Some(at);
        self.updated_at = at;
    }

    pub fn snapshot(&self) -> LeadSnapshot {
        LeadSnapshot {
            id: self.id,
            agent_id: self.agent_id,
            source: self.source.clone(),
            engagement_level: self.engagement_level,
            interaction_count: self.interaction_count,
            last_contacted: self.last_contacted,
            follow_up_date: self.follow_up_date,
            created_at: self.created_at,
            outcome: self.outcome,
            closed_at: self.closed_at,
        }
    }
}

/// Read-only view of the persisted lead fields needed for scoring and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub id: LeadId,
    pub agent_id: Option<AgentId>,
    pub source: Option<String>,
    pub engagement_level: EngagementLevel,
    pub interaction_count: u32,
    pub last_contacted: Option<DateTime<Utc>>,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<LeadOutcome>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl LeadSnapshot {
    /// Has a known terminal outcome (usable as a training example).
    pub fn is_labeled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_converted(&self) -> bool {
        self.outcome == Some(LeadOutcome::Converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn lead() -> Lead {
        Lead::new(OrganisationId::new(), "Ada", "Lovelace", "ada@example.com", t0())
    }

    #[test]
    fn snooze_rejects_past_deadline() {
        let mut l = lead();
        let err = l.snooze(t0() - Duration::hours(1), t0()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(!l.is_snoozed());
        assert!(l.snooze_until().is_none());
    }

    #[test]
    fn expired_snooze_clears_both_fields() {
        let mut l = lead();
        l.snooze(t0() + Duration::hours(1), t0()).unwrap();

        assert!(!l.expire_snooze(t0()));
        assert!(l.is_snoozed());

        let later = t0() + Duration::hours(2);
        assert!(l.expire_snooze(later));
        assert!(!l.is_snoozed());
        assert!(l.snooze_until().is_none());

        // second pass is a no-op
        assert!(!l.expire_snooze(later));
    }

    #[test]
    fn snooze_expires_exactly_at_deadline() {
        let mut l = lead();
        let until = t0() + Duration::minutes(30);
        l.snooze(until, t0()).unwrap();
        assert!(l.expire_snooze(until));
    }

    #[test]
    fn reminder_is_due_once_per_follow_up_date() {
        let mut l = lead();
        let date = t0() + Duration::days(1);
        l.schedule_follow_up(date, Some("call back".into()), t0());

        assert!(!l.reminder_due(t0()));
        let now = date + Duration::minutes(5);
        assert!(l.reminder_due(now));

        l.mark_reminded(date);
        assert!(!l.reminder_due(now));
        assert!(!l.is_follow_up_overdue(now));
        assert!(l.is_follow_up_overdue(date + Duration::days(1)));

        // moving the date re-arms the reminder
        let moved = now + Duration::hours(2);
        l.schedule_follow_up(moved, None, now);
        assert!(l.reminder_due(moved));
    }

    #[test]
    fn moving_back_to_a_reminded_date_rearms_it() {
        let mut l = lead();
        let d = t0() + Duration::days(1);
        let e = t0() + Duration::days(2);
        l.schedule_follow_up(d, None, t0());
        l.mark_reminded(d);

        l.schedule_follow_up(e, None, t0());
        l.schedule_follow_up(d, None, t0());
        assert!(l.reminder_due(d));

        // Same date again keeps the marker.
        l.mark_reminded(d);
        l.schedule_follow_up(d, Some("new notes".into()), t0());
        assert!(!l.reminder_due(d));
    }

    #[test]
    fn clearing_the_follow_up_resets_the_reminder() {
        let mut l = lead();
        let d = t0() + Duration::days(1);
        l.schedule_follow_up(d, None, t0());
        l.mark_reminded(d);

        l.clear_follow_up(t0());
        assert_eq!(l.last_reminded_for(), None);
        assert!(!l.is_follow_up_overdue(d + Duration::days(3)));

        l.schedule_follow_up(d, None, t0());
        assert!(l.reminder_due(d));
    }

    #[test]
    fn snoozed_lead_is_not_reminded() {
        let mut l = lead();
        let date = t0() + Duration::hours(1);
        l.schedule_follow_up(date, None, t0());
        l.snooze(t0() + Duration::days(2), t0()).unwrap();
        assert!(!l.reminder_due(date + Duration::hours(1)));
    }

    #[test]
    fn clear_reminder_marker_only_for_matching_date() {
        let mut l = lead();
        let date = t0();
        l.mark_reminded(date);
        l.clear_reminder_marker(date + Duration::hours(1));
        assert_eq!(l.last_reminded_for(), Some(date));
        l.clear_reminder_marker(date);
        assert_eq!(l.last_reminded_for(), None);
    }

    #[test]
    fn interactions_drive_engagement() {
        let mut l = lead();
        for i in 0..6 {
            l.record_interaction(InteractionType::Call, t0() + Duration::hours(i));
        }
        assert_eq!(l.interaction_count(), 6);
        assert_eq!(l.engagement_level(), EngagementLevel::High);
        assert_eq!(l.last_contacted(), Some(t0() + Duration::hours(5)));
        assert_eq!(l.last_interaction_type(), Some(InteractionType::Call));
    }

    #[test]
    fn score_clips_and_rounds() {
        assert_eq!(Score::new(250).value(), 100);
        assert_eq!(Score::from_probability(0.456).value(), 46);
        assert_eq!(Score::from_f64(-3.0), Score::MIN);
        assert_eq!(Score::from_f64(f64::NAN), Score::MIN);
    }

    #[test]
    fn snapshot_reflects_outcome() {
        let mut l = lead();
        assert!(!l.snapshot().is_labeled());
        l.close(LeadOutcome::Converted, t0());
        let s = l.snapshot();
        assert!(s.is_labeled());
        assert!(s.is_converted());
        assert_eq!(s.closed_at, Some(t0()));
    }
}
