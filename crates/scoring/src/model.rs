use leadflow_leads::Score;

use crate::artifact::ModelArtifact;
use crate::classifier::LogisticModel;
use crate::error::{ModelLoadError, ScoringError};
use crate::features::{FEATURE_SCHEMA, FeatureVector, NEVER_CONTACTED_DAYS, SourceChannel};

/// A model that turns a feature vector into a 0–100 score.
pub trait ScoringModel: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    fn score(&self, features: &FeatureVector) -> Result<Score, ScoringError>;
}

/// Fixed weighted-sum rule over engagement, recency, interaction volume and
/// source quality, clipped to \[0, 100\].
///
/// Reads features by name, so it does not depend on any artifact's schema.
/// Missing or non-finite inputs are treated as their sentinel values.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicFallback;

impl HeuristicFallback {
    pub fn new() -> Self {
        Self
    }

    /// Infallible scoring entry point.
    pub fn evaluate(&self, features: &FeatureVector) -> Score {
        let read = |name: &str, sentinel: f64| {
            features
                .get(name)
                .filter(|v| v.is_finite())
                .unwrap_or(sentinel)
        };

        let engagement = match read("engagement_level", 0.0).round() {
            e if e >= 2.0 => 40.0,
            e if e >= 1.0 => 25.0,
            _ => 10.0,
        };

        let interactions = read("interaction_count", 0.0).max(0.0);
        let volume = (interactions * 5.0).min(20.0);

        let days = read("days_since_last_contact", NEVER_CONTACTED_DAYS);
        let recency = if days < 0.0 {
            0.0
        } else if days <= 7.0 {
            25.0
        } else if days <= 30.0 {
            15.0
        } else {
            0.0
        };

        let channel = SourceChannel::ALL
            .into_iter()
            .find(|c| read(c.feature_name(), 0.0) >= 0.5)
            .unwrap_or(SourceChannel::Unknown);

        Score::from_f64(engagement + volume + recency + source_quality(channel))
    }
}

fn source_quality(channel: SourceChannel) -> f64 {
    match channel {
        SourceChannel::Referral => 15.0,
        SourceChannel::Event => 12.0,
        SourceChannel::Website => 10.0,
        SourceChannel::Email => 8.0,
        SourceChannel::Social => 6.0,
        SourceChannel::Unknown => 3.0,
    }
}

impl ScoringModel for HeuristicFallback {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn score(&self, features: &FeatureVector) -> Result<Score, ScoringError> {
        Ok(self.evaluate(features))
    }
}

/// Classifier decoded from a [`ModelArtifact`]; score = round(P(convert) × 100).
#[derive(Debug, Clone)]
pub struct TrainedClassifier {
    version: u64,
    schema: Vec<String>,
    model: LogisticModel,
}

impl TrainedClassifier {
    /// Decode and validate an artifact.
    ///
    /// Compatibility with the current extractor is checked here, before any
    /// inference is attempted.
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, ModelLoadError> {
        let version = artifact.version;
        let model: LogisticModel = serde_json::from_value(artifact.parameters.clone())
            .map_err(|e| ModelLoadError::CorruptParameters {
                version,
                reason: e.to_string(),
            })?;

        if !model.is_well_formed() {
            return Err(ModelLoadError::CorruptParameters {
                version,
                reason: "parameter dimensions disagree or contain non-finite values".into(),
            });
        }

        if model.dimension() != artifact.feature_schema.len() {
            return Err(ModelLoadError::IncompatibleSchema {
                version,
                reason: format!(
                    "schema lists {} features, parameters expect {}",
                    artifact.feature_schema.len(),
                    model.dimension()
                ),
            });
        }

        if let Some(unknown) = artifact
            .feature_schema
            .iter()
            .find(|name| !FEATURE_SCHEMA.contains(&name.as_str()))
        {
            return Err(ModelLoadError::IncompatibleSchema {
                version,
                reason: format!("extractor does not produce `{unknown}`"),
            });
        }

        Ok(Self {
            version,
            schema: artifact.feature_schema.clone(),
            model,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn probability(&self, features: &FeatureVector) -> Result<f64, ScoringError> {
        let x = features.project(&self.schema)?;
        let p = self.model.predict_proba(&x);
        if p.is_finite() {
            Ok(p)
        } else {
            Err(ScoringError::NonFiniteOutput)
        }
    }
}

impl ScoringModel for TrainedClassifier {
    fn name(&self) -> &'static str {
        "logistic_regression"
    }

    fn score(&self, features: &FeatureVector) -> Result<Score, ScoringError> {
        self.probability(features).map(Score::from_probability)
    }
}
