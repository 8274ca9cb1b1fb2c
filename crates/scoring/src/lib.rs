//! `leadflow-scoring`
//!
//! **Responsibility:** lead scoring engine.
//!
//! - Feature extraction from read-only lead snapshots.
//! - Two scoring models: a trained classifier and a deterministic heuristic.
//! - Versioned, append-only model artifacts with an atomically swapped "current".
//! - Training gated on a minimum number of labeled leads.
//!
//! Scoring never fails from the caller's point of view: [`LeadScorer`] absorbs
//! model errors and degrades to [`HeuristicFallback`].

pub mod artifact;
pub mod classifier;
pub mod error;
pub mod features;
pub mod model;
pub mod scorer;
pub mod store;
pub mod trainer;

pub use artifact::ModelArtifact;
pub use classifier::{BinaryMetrics, FitParams, LogisticModel};
pub use error::{ModelLoadError, ModelStoreError, ScoringError, TrainingError};
pub use features::{FEATURE_SCHEMA, FeatureExtractor, FeatureVector, SourceChannel};
pub use model::{HeuristicFallback, ScoringModel, TrainedClassifier};
pub use scorer::{
    DEFAULT_FAILURE_THRESHOLD, FallbackReason, LeadScorer, ScoreOutcome, ScoreSource, ScoringHealth,
};
pub use store::{FileModelStore, InMemoryModelStore, ModelStore};
pub use trainer::{Trainer, TrainerConfig, DEFAULT_MIN_TRAINING_SAMPLES};
