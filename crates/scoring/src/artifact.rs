use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A persisted, versioned trained model.
///
/// Artifacts are append-only: once published they are never mutated, only
/// superseded by a higher version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Monotonically increasing identity.
    pub version: u64,
    /// Ordered feature names the parameters were fitted against.
    pub feature_schema: Vec<String>,
    /// Model parameters. Opaque to the store; decoded by the classifier.
    pub parameters: JsonValue,
    pub trained_at: DateTime<Utc>,
    /// Number of labeled leads the model was built from.
    pub training_size: usize,
    pub metrics: BTreeMap<String, f64>,
}

impl ModelArtifact {
    pub fn new(
        version: u64,
        feature_schema: Vec<String>,
        parameters: JsonValue,
        trained_at: DateTime<Utc>,
        training_size: usize,
    ) -> Self {
        Self {
            version,
            feature_schema,
            parameters,
            trained_at,
            training_size,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}
