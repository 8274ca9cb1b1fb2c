use thiserror::Error;

/// Inference failed for a single feature vector.
///
/// Never surfaced to scoring callers; [`crate::LeadScorer`] degrades to the
/// heuristic instead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("model produced a non-finite probability")]
    NonFiniteOutput,
}

/// A persisted artifact could not be turned into a usable model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelLoadError {
    #[error("artifact v{version} has corrupt parameters: {reason}")]
    CorruptParameters { version: u64, reason: String },

    #[error("artifact v{version} is incompatible with the feature extractor: {reason}")]
    IncompatibleSchema { version: u64, reason: String },

    #[error("failed to read artifact {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelStoreError {
    #[error("artifact version {attempted} is not newer than current version {current}")]
    StaleVersion { current: u64, attempted: u64 },

    #[error("artifact v{0} already exists")]
    AlreadyExists(u64),

    #[error("storage error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("model store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrainingError {
    /// Recoverable: the caller keeps using fallback scoring.
    #[error("insufficient data for training: {labeled} labeled leads, {required} required")]
    InsufficientData { labeled: usize, required: usize },

    #[error("training data contains a single outcome class")]
    DegenerateLabels,

    #[error("failed to encode model parameters: {0}")]
    Encoding(String),

    #[error(transparent)]
    Store(#[from] ModelStoreError),
}
