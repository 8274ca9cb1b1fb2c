use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use leadflow_leads::LeadSnapshot;

use crate::artifact::ModelArtifact;
use crate::classifier::{BinaryMetrics, FitParams, LogisticModel};
use crate::error::TrainingError;
use crate::features::FeatureExtractor;
use crate::store::ModelStore;

/// Labeled leads required before a model is trained.
pub const DEFAULT_MIN_TRAINING_SAMPLES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerConfig {
    pub min_samples: usize,
    /// Every n-th sample of each class is held out for evaluation (n ≥ 2).
    pub eval_every: usize,
    pub fit: FitParams,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_TRAINING_SAMPLES,
            eval_every: 5,
            fit: FitParams::default(),
        }
    }
}

/// Fits a classifier on closed leads and publishes it as the next artifact.
pub struct Trainer {
    extractor: FeatureExtractor,
    store: Arc<dyn ModelStore>,
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(store: Arc<dyn ModelStore>, config: TrainerConfig) -> Self {
        Self {
            extractor: FeatureExtractor::new(),
            store,
            config,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train on the labeled subset of `leads` and publish the result.
    ///
    /// On any error the store is left untouched and scoring keeps using
    /// whatever was current before.
    pub fn train(
        &self,
        leads: &[LeadSnapshot],
        now: DateTime<Utc>,
    ) -> Result<Arc<ModelArtifact>, TrainingError> {
        let mut labeled: Vec<&LeadSnapshot> = leads.iter().filter(|l| l.is_labeled()).collect();
        if labeled.len() < self.config.min_samples {
            warn!(
                labeled = labeled.len(),
                required = self.config.min_samples,
                "not enough labeled leads to train; keeping current scoring"
            );
            return Err(TrainingError::InsufficientData {
                labeled: labeled.len(),
                required: self.config.min_samples,
            });
        }
        labeled.sort_by_key(|l| l.id);

        let mut train = Split::default();
        let mut eval = Split::default();
        let (mut seen_pos, mut seen_neg) = (0usize, 0usize);
        let every = self.config.eval_every.max(2);

        for lead in &labeled {
            // Snapshots are taken as of the close time so features match what
            // the lead looked like when the outcome was decided.
            let as_of = lead.closed_at.unwrap_or(now);
            let x = self.extractor.extract(lead, as_of).values().to_vec();
            let y = lead.is_converted();

            let seen = if y { &mut seen_pos } else { &mut seen_neg };
            *seen += 1;
            if *seen % every == 0 {
                eval.push(x, y);
            } else {
                train.push(x, y);
            }
        }

        if train.labels.iter().all(|y| *y) || train.labels.iter().all(|y| !*y) {
            warn!(samples = train.len(), "training set has a single outcome class");
            return Err(TrainingError::DegenerateLabels);
        }

        let model = LogisticModel::fit(&train.samples, &train.labels, &self.config.fit);
        let metrics = if eval.is_empty() {
            BinaryMetrics::evaluate(&model, &train.samples, &train.labels)
        } else {
            BinaryMetrics::evaluate(&model, &eval.samples, &eval.labels)
        };

        let parameters =
            serde_json::to_value(&model).map_err(|e| TrainingError::Encoding(e.to_string()))?;
        let positives = labeled.iter().filter(|l| l.is_converted()).count();

        let artifact = ModelArtifact::new(
            self.store.next_version(),
            self.extractor.schema(),
            parameters,
            now,
            labeled.len(),
        )
        .with_metric("accuracy", metrics.accuracy)
        .with_metric("precision", metrics.precision)
        .with_metric("recall", metrics.recall)
        .with_metric("f1", metrics.f1)
        .with_metric("train_samples", train.len() as f64)
        .with_metric("eval_samples", eval.len() as f64)
        .with_metric("positive_rate", positives as f64 / labeled.len() as f64);

        // A concurrent training may have published since `next_version()` was
        // read; take whichever version is free at publish time.
        let published = self.store.publish_next(artifact)?;
        info!(
            version = published.version,
            training_size = published.training_size,
            accuracy = metrics.accuracy,
            f1 = metrics.f1,
            "lead scoring model trained"
        );
        Ok(published)
    }
}

#[derive(Debug, Default)]
struct Split {
    samples: Vec<Vec<f64>>,
    labels: Vec<bool>,
}

impl Split {
    fn push(&mut self, x: Vec<f64>, y: bool) {
        self.samples.push(x);
        self.labels.push(y);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
