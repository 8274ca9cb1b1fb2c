use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use leadflow_leads::{LeadSnapshot, Score};

use crate::features::FeatureExtractor;
use crate::model::{HeuristicFallback, ScoringModel, TrainedClassifier};
use crate::store::ModelStore;

/// Consecutive failures of one artifact version before it is quarantined.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No artifact has been published yet.
    NoModel,
    /// The current artifact could not be decoded.
    LoadFailed,
    /// The decoded model failed on this lead.
    InferenceFailed,
    /// The current artifact failed too often and is skipped until replaced.
    Quarantined,
}

/// Which model produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreSource {
    Trained { version: u64 },
    Fallback { reason: FallbackReason },
}

impl ScoreSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ScoreSource::Fallback { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    pub score: Score,
    pub source: ScoreSource,
}

/// Point-in-time view of the scorer's model state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScoringHealth {
    /// Version of the artifact scoring is currently using, if any.
    pub active_version: Option<u64>,
    pub consecutive_failures: u32,
    pub quarantined_version: Option<u64>,
}

#[derive(Default)]
struct ScorerState {
    cached: Option<Arc<TrainedClassifier>>,
    failing_version: Option<u64>,
    consecutive_failures: u32,
    quarantined_version: Option<u64>,
}

/// Scores leads with the current trained model, degrading to
/// [`HeuristicFallback`] whenever that is not possible.
///
/// `score` never fails. Every degradation is logged; a version that keeps
/// failing is quarantined (one `error!`) so it stops being retried on every
/// lead until a newer artifact is published.
pub struct LeadScorer {
    store: Arc<dyn ModelStore>,
    extractor: FeatureExtractor,
    fallback: HeuristicFallback,
    failure_threshold: u32,
    state: Mutex<ScorerState>,
}

impl LeadScorer {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self {
            store,
            extractor: FeatureExtractor::new(),
            fallback: HeuristicFallback::new(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            state: Mutex::new(ScorerState::default()),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn score(&self, lead: &LeadSnapshot, as_of: DateTime<Utc>) -> ScoreOutcome {
        let features = self.extractor.extract(lead, as_of);
        let degrade = |reason| ScoreOutcome {
            score: self.fallback.evaluate(&features),
            source: ScoreSource::Fallback { reason },
        };

        let Some(artifact) = self.store.current() else {
            return degrade(FallbackReason::NoModel);
        };
        let version = artifact.version;

        if self.is_quarantined(version) {
            return degrade(FallbackReason::Quarantined);
        }

        let classifier = match self.classifier_for(version) {
            Some(c) => c,
            None => match TrainedClassifier::from_artifact(&artifact) {
                Ok(c) => {
                    let c = Arc::new(c);
                    self.state().cached = Some(c.clone());
                    c
                }
                Err(e) => {
                    warn!(lead_id = %lead.id, version, error = %e, "model load failed; using heuristic");
                    self.record_failure(version);
                    return degrade(FallbackReason::LoadFailed);
                }
            },
        };

        match classifier.score(&features) {
            Ok(score) => {
                self.record_success(version);
                ScoreOutcome {
                    score,
                    source: ScoreSource::Trained { version },
                }
            }
            Err(e) => {
                warn!(
                    lead_id = %lead.id,
                    version,
                    model = classifier.name(),
                    error = %e,
                    "inference failed; using heuristic"
                );
                self.record_failure(version);
                degrade(FallbackReason::InferenceFailed)
            }
        }
    }

    pub fn health(&self) -> ScoringHealth {
        let current = self.store.current().map(|a| a.version);
        let state = self.state();
        let active_version = current.filter(|v| state.quarantined_version != Some(*v));
        ScoringHealth {
            active_version,
            consecutive_failures: state.consecutive_failures,
            quarantined_version: state.quarantined_version,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScorerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_quarantined(&self, version: u64) -> bool {
        let mut state = self.state();
        match state.quarantined_version {
            Some(q) if q == version => true,
            Some(q) if version > q => {
                // Superseded: the new artifact gets a clean slate.
                state.quarantined_version = None;
                state.failing_version = None;
                state.consecutive_failures = 0;
                false
            }
            _ => false,
        }
    }

    fn classifier_for(&self, version: u64) -> Option<Arc<TrainedClassifier>> {
        self.state()
            .cached
            .as_ref()
            .filter(|c| c.version() == version)
            .cloned()
    }

    fn record_success(&self, version: u64) {
        let mut state = self.state();
        if state.failing_version == Some(version) {
            state.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, version: u64) {
        let mut state = self.state();
        if state.failing_version != Some(version) {
            state.failing_version = Some(version);
            state.consecutive_failures = 0;
        }
        state.consecutive_failures += 1;

        if state.consecutive_failures >= self.failure_threshold
            && state.quarantined_version != Some(version)
        {
            state.quarantined_version = Some(version);
            state.cached = None;
            error!(
                version,
                failures = state.consecutive_failures,
                "model artifact quarantined after repeated failures; scoring with heuristic until a newer model is published"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelArtifact;
    use crate::classifier::LogisticModel;
    use crate::store::InMemoryModelStore;
    use chrono::{Duration, TimeZone};
    use leadflow_core::LeadId;
    use leadflow_leads::EngagementLevel;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn lead() -> LeadSnapshot {
        LeadSnapshot {
            id: LeadId::new(),
            agent_id: None,
            source: Some("referral".into()),
            engagement_level: EngagementLevel::Medium,
            interaction_count: 5,
            last_contacted: Some(t0() - Duration::days(10)),
            follow_up_date: None,
            created_at: t0() - Duration::days(40),
            outcome: None,
            closed_at: None,
        }
    }

    fn model_artifact(version: u64, model: LogisticModel, schema: &[&str]) -> ModelArtifact {
        ModelArtifact::new(
            version,
            schema.iter().map(|s| s.to_string()).collect(),
            serde_json::to_value(model).unwrap(),
            t0(),
            50,
        )
    }

    fn constant_model(version: u64, bias: f64) -> ModelArtifact {
        model_artifact(
            version,
            LogisticModel {
                weights: vec![0.0],
                bias,
                means: vec![0.0],
                scales: vec![1.0],
            },
            &["interaction_count"],
        )
    }

    fn corrupt(version: u64) -> ModelArtifact {
        ModelArtifact::new(
            version,
            vec!["interaction_count".into()],
            json!({"weights": "garbage"}),
            t0(),
            50,
        )
    }

    #[test]
    fn no_model_uses_heuristic() {
        let store = InMemoryModelStore::arc();
        let scorer = LeadScorer::new(store);

        let out = scorer.score(&lead(), t0());
        assert_eq!(
            out.source,
            ScoreSource::Fallback {
                reason: FallbackReason::NoModel
            }
        );
        // Medium (25) + 5 interactions (20) + contacted 10 days ago (15) + referral (15).
        assert_eq!(out.score.value(), 75);
        assert_eq!(scorer.health(), ScoringHealth::default());
    }

    #[test]
    fn trained_model_is_used_and_swapped() {
        let store = InMemoryModelStore::arc();
        let scorer = LeadScorer::new(store.clone());

        store.publish(constant_model(1, 0.0)).unwrap();
        let out = scorer.score(&lead(), t0());
        assert_eq!(out.source, ScoreSource::Trained { version: 1 });
        assert_eq!(out.score.value(), 50);

        store.publish(constant_model(2, 10.0)).unwrap();
        let out = scorer.score(&lead(), t0());
        assert_eq!(out.source, ScoreSource::Trained { version: 2 });
        assert_eq!(out.score.value(), 100);
        assert_eq!(scorer.health().active_version, Some(2));
    }

    #[test]
    fn corrupt_artifact_degrades_then_quarantines() {
        let store = InMemoryModelStore::arc();
        let scorer = LeadScorer::new(store.clone()).with_failure_threshold(3);
        store.publish(corrupt(1)).unwrap();

        for _ in 0..3 {
            let out = scorer.score(&lead(), t0());
            assert_eq!(
                out.source,
                ScoreSource::Fallback {
                    reason: FallbackReason::LoadFailed
                }
            );
        }
        let out = scorer.score(&lead(), t0());
        assert_eq!(
            out.source,
            ScoreSource::Fallback {
                reason: FallbackReason::Quarantined
            }
        );
        assert_eq!(out.score.value(), 75);

        let health = scorer.health();
        assert_eq!(health.quarantined_version, Some(1));
        assert_eq!(health.active_version, None);
        assert_eq!(health.consecutive_failures, 3);

        // A newer artifact lifts the quarantine.
        store.publish(constant_model(2, 0.0)).unwrap();
        let out = scorer.score(&lead(), t0());
        assert_eq!(out.source, ScoreSource::Trained { version: 2 });
        assert_eq!(scorer.health().quarantined_version, None);
        assert_eq!(scorer.health().consecutive_failures, 0);
    }

    #[test]
    fn non_finite_inference_falls_back() {
        let store = InMemoryModelStore::arc();
        let scorer = LeadScorer::new(store.clone());
        // Overflows to +inf and -inf, summing to NaN.
        store
            .publish(model_artifact(
                1,
                LogisticModel {
                    weights: vec![1e308, -1e308],
                    bias: 0.0,
                    means: vec![0.0, 0.0],
                    scales: vec![1.0, 1.0],
                },
                &["days_since_last_contact", "interaction_count"],
            ))
            .unwrap();

        let out = scorer.score(&lead(), t0());
        assert_eq!(
            out.source,
            ScoreSource::Fallback {
                reason: FallbackReason::InferenceFailed
            }
        );
        assert_eq!(out.score.value(), 75);
        assert_eq!(scorer.health().consecutive_failures, 1);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let store = InMemoryModelStore::arc();
        let scorer = LeadScorer::new(store.clone()).with_failure_threshold(2);
        store
            .publish(model_artifact(
                1,
                LogisticModel {
                    weights: vec![1e308, -1e308],
                    bias: 0.0,
                    means: vec![0.0, 0.0],
                    scales: vec![1.0, 1.0],
                },
                &["days_since_last_contact", "interaction_count"],
            ))
            .unwrap();

        scorer.score(&lead(), t0());
        // Never contacted and no interactions: 999·1e308 overflows but 0·-1e308 is 0.
        let mut quiet = lead();
        quiet.last_contacted = None;
        quiet.interaction_count = 0;
        let out = scorer.score(&quiet, t0());
        assert_eq!(out.source, ScoreSource::Trained { version: 1 });
        assert_eq!(scorer.health().consecutive_failures, 0);
        assert_eq!(scorer.health().quarantined_version, None);
    }
}
