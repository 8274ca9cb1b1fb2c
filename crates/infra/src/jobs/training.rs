//! Model training as a task body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use leadflow_scoring::{ModelArtifact, Trainer};

use crate::repository::LeadRepository;

use super::JobError;

/// Summary kept on the training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub version: u64,
    pub training_size: usize,
    pub trained_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

impl From<&ModelArtifact> for TrainingReport {
    fn from(a: &ModelArtifact) -> Self {
        Self {
            version: a.version,
            training_size: a.training_size,
            trained_at: a.trained_at,
            metrics: a.metrics.clone(),
        }
    }
}

/// Train on a snapshot of all leads and publish the result.
pub fn train(
    leads: &dyn LeadRepository,
    trainer: &Trainer,
    now: DateTime<Utc>,
) -> Result<TrainingReport, JobError> {
    let history = leads.snapshots()?;
    let artifact = trainer.train(&history, now)?;
    Ok(TrainingReport::from(artifact.as_ref()))
}
