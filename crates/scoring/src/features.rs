//! Lead → fixed-width numeric feature vector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_leads::LeadSnapshot;

use crate::error::ScoringError;

/// Order of the features produced by [`FeatureExtractor::extract`].
pub const FEATURE_SCHEMA: [&str; 12] = [
    "days_since_last_contact",
    "interaction_count",
    "engagement_level",
    "source_website",
    "source_referral",
    "source_social",
    "source_email",
    "source_event",
    "source_unknown",
    "has_agent",
    "has_follow_up",
    "days_since_created",
];

/// Sentinel for "never contacted".
pub const NEVER_CONTACTED_DAYS: f64 = 999.0;

/// Normalised lead acquisition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Website,
    Referral,
    Social,
    Email,
    Event,
    Unknown,
}

impl SourceChannel {
    pub const ALL: [SourceChannel; 6] = [
        SourceChannel::Website,
        SourceChannel::Referral,
        SourceChannel::Social,
        SourceChannel::Email,
        SourceChannel::Event,
        SourceChannel::Unknown,
    ];

    /// Map free-text source to a channel. Missing or unrecognised → `Unknown`.
    pub fn from_source(source: Option<&str>) -> Self {
        let Some(raw) = source else {
            return SourceChannel::Unknown;
        };
        let s = raw.trim().to_ascii_lowercase();
        if s.is_empty() {
            SourceChannel::Unknown
        } else if s.contains("refer") {
            SourceChannel::Referral
        } else if s.contains("web") || s.contains("site") || s.contains("seo") {
            SourceChannel::Website
        } else if ["social", "facebook", "linkedin", "twitter", "instagram"]
            .iter()
            .any(|k| s.contains(k))
        {
            SourceChannel::Social
        } else if s.contains("mail") || s.contains("newsletter") {
            SourceChannel::Email
        } else if ["event", "conference", "trade show", "expo"]
            .iter()
            .any(|k| s.contains(k))
        {
            SourceChannel::Event
        } else {
            SourceChannel::Unknown
        }
    }

    /// Name of this channel's one-hot feature.
    pub fn feature_name(self) -> &'static str {
        match self {
            SourceChannel::Website => "source_website",
            SourceChannel::Referral => "source_referral",
            SourceChannel::Social => "source_social",
            SourceChannel::Email => "source_email",
            SourceChannel::Event => "source_event",
            SourceChannel::Unknown => "source_unknown",
        }
    }
}

/// Ephemeral feature vector in [`FEATURE_SCHEMA`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    /// Wrap raw values assumed to be in [`FEATURE_SCHEMA`] order.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of a named feature.
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_SCHEMA
            .iter()
            .position(|n| *n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    /// Reorder into `schema` (e.g. the schema recorded in a model artifact).
    ///
    /// Fails when the schema names a feature this extractor does not produce.
    pub fn project(&self, schema: &[String]) -> Result<Vec<f64>, ScoringError> {
        schema
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    ScoringError::SchemaMismatch(format!("unknown feature `{name}`"))
                })
            })
            .collect()
    }
}

/// Converts lead snapshots into feature vectors.
///
/// Deterministic: the output depends only on the snapshot and `as_of`. Never
/// fails; missing optional fields map to fixed sentinels.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn schema(&self) -> Vec<String> {
        FEATURE_SCHEMA.iter().map(|s| s.to_string()).collect()
    }

    pub fn extract(&self, lead: &LeadSnapshot, as_of: DateTime<Utc>) -> FeatureVector {
        let days_since_last_contact = lead
            .last_contacted
            .map_or(NEVER_CONTACTED_DAYS, |t| days_between(t, as_of));
        let channel = SourceChannel::from_source(lead.source.as_deref());

        let mut values = Vec::with_capacity(FEATURE_SCHEMA.len());
        values.push(days_since_last_contact);
        values.push(lead.interaction_count as f64);
        values.push(lead.engagement_level.ordinal() as f64);
        for c in SourceChannel::ALL {
            values.push(if c == channel { 1.0 } else { 0.0 });
        }
        values.push(flag(lead.agent_id.is_some()));
        values.push(flag(lead.follow_up_date.is_some()));
        values.push(days_between(lead.created_at, as_of));

        FeatureVector { values }
    }
}

fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_days().max(0) as f64
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use leadflow_core::{AgentId, LeadId};
    use leadflow_leads::EngagementLevel;

    fn snapshot() -> LeadSnapshot {
        LeadSnapshot {
            id: LeadId::new(),
            agent_id: None,
            source: None,
            engagement_level: EngagementLevel::Medium,
            interaction_count: 4,
            last_contacted: None,
            follow_up_date: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            outcome: None,
            closed_at: None,
        }
    }

    #[test]
    fn missing_fields_map_to_sentinels() {
        let s = snapshot();
        let as_of = s.created_at + Duration::days(10);
        let v = FeatureExtractor::new().extract(&s, as_of);

        assert_eq!(v.len(), FEATURE_SCHEMA.len());
        assert_eq!(v.get("days_since_last_contact"), Some(NEVER_CONTACTED_DAYS));
        assert_eq!(v.get("source_unknown"), Some(1.0));
        assert_eq!(v.get("has_agent"), Some(0.0));
        assert_eq!(v.get("engagement_level"), Some(1.0));
        assert_eq!(v.get("days_since_created"), Some(10.0));
    }

    #[test]
    fn source_is_one_hot() {
        let mut s = snapshot();
        s.source = Some("  Customer Referral ".into());
        s.agent_id = Some(AgentId::new());
        let v = FeatureExtractor::new().extract(&s, s.created_at);

        let hot: Vec<&str> = SourceChannel::ALL
            .iter()
            .map(|c| c.feature_name())
            .filter(|n| v.get(n) == Some(1.0))
            .collect();
        assert_eq!(hot, vec!["source_referral"]);
        assert_eq!(v.get("has_agent"), Some(1.0));
    }

    #[test]
    fn extraction_is_deterministic() {
        let s = snapshot();
        let as_of = s.created_at + Duration::hours(30);
        let e = FeatureExtractor::new();
        assert_eq!(e.extract(&s, as_of), e.extract(&s, as_of));
    }

    #[test]
    fn future_timestamps_do_not_go_negative() {
        let mut s = snapshot();
        s.last_contacted = Some(s.created_at + Duration::days(3));
        let v = FeatureExtractor::new().extract(&s, s.created_at);
        assert_eq!(v.get("days_since_last_contact"), Some(0.0));
    }

    #[test]
    fn projection_follows_artifact_order() {
        let v = FeatureExtractor::new().extract(&snapshot(), snapshot().created_at);
        let projected = v
            .project(&["engagement_level".to_string(), "interaction_count".to_string()])
            .unwrap();
        assert_eq!(projected, vec![1.0, 4.0]);

        let err = v.project(&["lead_age".to_string()]).unwrap_err();
        assert!(matches!(err, ScoringError::SchemaMismatch(_)));
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(SourceChannel::from_source(Some("Website")), SourceChannel::Website);
        assert_eq!(SourceChannel::from_source(Some("LinkedIn ad")), SourceChannel::Social);
        assert_eq!(SourceChannel::from_source(Some("newsletter")), SourceChannel::Email);
        assert_eq!(SourceChannel::from_source(Some("Trade show")), SourceChannel::Event);
        assert_eq!(SourceChannel::from_source(Some("cold call")), SourceChannel::Unknown);
        assert_eq!(SourceChannel::from_source(Some("   ")), SourceChannel::Unknown);
    }
}
