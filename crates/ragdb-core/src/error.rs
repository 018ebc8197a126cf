use std::time::Duration;

use thiserror::Error;

use crate::types::Stage;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ingestion partially failed: {failed} of {total} chunks were not stored")]
    IngestionPartialFailure { failed: usize, total: usize },

    #[error("Dimension mismatch in collection '{collection}': expected {expected}, got {actual}")]
    DimensionMismatch { collection: String, expected: usize, actual: usize },

    #[error("Model mismatch in collection '{collection}': expected '{expected}', got '{actual}'")]
    ModelMismatch { collection: String, expected: String, actual: String },

    #[error("Index for collection '{0}' is not trained")]
    NotTrained(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timed out after {budget:?} during {}", stage_label(.stage))]
    TimedOut { stage: Option<Stage>, budget: Duration },

    #[error("Cache partition '{collection}' was invalidated while the result was computed")]
    CacheInvalidationConflict { collection: String },

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("{stage} failed after {attempts} attempt(s): {source}")]
    Stage {
        stage: Stage,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt index artifact: {0}")]
    CorruptArtifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn stage_label(stage: &Option<Stage>) -> String {
    stage.map_or_else(|| "RECEIVED".to_string(), |s| s.to_string())
}

impl Error {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap this error with the stage that produced it.
    pub fn at_stage(self, stage: Stage, attempts: u32) -> Self {
        match self {
            // Already attributed errors keep their original stage.
            e @ Self::Stage { .. } => e,
            e @ Self::TimedOut { .. } => e,
            other => Self::Stage { stage, attempts, source: Box::new(other) },
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Stage { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Whether the failing operation was attempted more than once.
    pub fn retried(&self) -> bool {
        self.attempts() > 1
    }

    /// The innermost error, skipping stage attribution.
    pub fn root(&self) -> &Error {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
