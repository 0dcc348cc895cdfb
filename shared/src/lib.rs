// lib.rs - Pest identification resolution pipeline

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod classifier;
pub mod config;
pub mod detection_store;
pub mod image_processing;
pub mod knowledge;
pub mod localization;
pub mod model;
pub mod persister;
pub mod pipeline;
pub mod resolver;
pub mod storage;
pub mod telemetry;

use serde::{Deserialize, Serialize};

pub use classifier::{ClassLabels, ClassificationEngine, ClassifyError, ModelBackend};
pub use config::{ConfigError, PipelineConfig};
pub use detection_store::{DetectionStore, SqliteDetectionStore, StoreError};
pub use image_processing::{ImagePreprocessor, ImageProcessingError, ImageTensor, PreprocessConfig};
pub use knowledge::{KnowledgeBase, KnowledgeError, KnowledgeRecord, RecordOrigin};
pub use localization::{LocalizationSelector, LocalizedView};
pub use model::{
    AggregateCounter, ClassificationResult, DetectionId, DetectionRecord, Locale, Severity,
    SpeciesId, StorageReference, StorageTier, UnixTimeMs,
};
pub use persister::{DetectionPersister, PersistError};
pub use pipeline::{
    DetectionReader, DetectionResponse, InferenceOutput, Pipeline, PipelineError, StatsReport,
};
pub use resolver::{CanonicalSpecies, MatchStep, Resolution, SpeciesCatalog, UnresolvedMarker};
pub use storage::{HttpObjectStore, LocalUploadStore, ObjectStore, StorageError, TieredImageStore};

#[cfg(feature = "ml")]
pub use classifier::OnnxBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

/// Stable classification of caller-visible pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Decode,
    ModelUnavailable,
    InvalidModelOutput,
    Overloaded,
    Persistence,
    NotFound,
    Configuration,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Decode => "DECODE_ERROR",
            Self::ModelUnavailable => "MODEL_UNAVAILABLE",
            Self::InvalidModelOutput => "INVALID_MODEL_OUTPUT",
            Self::Overloaded => "OVERLOADED",
            Self::Persistence => "PERSISTENCE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Overloaded | Self::Persistence => ErrorSeverity::Transient,

            Self::ModelUnavailable | Self::Configuration | Self::Internal => ErrorSeverity::Fatal,

            Self::Decode | Self::InvalidModelOutput | Self::NotFound => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Overloaded | Self::Persistence)
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::Decode => Some(400),
            Self::NotFound => Some(404),
            Self::Overloaded | Self::ModelUnavailable => Some(503),
            Self::InvalidModelOutput | Self::Persistence | Self::Internal => Some(500),
            Self::Configuration => None,
        }
    }
}

/// Serializable error body for shells that report failures as data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub code: String,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub message: String,
}

impl From<&PipelineError> for ErrorReport {
    fn from(error: &PipelineError) -> Self {
        let kind = error.kind();
        Self {
            kind,
            code: kind.code().to_string(),
            severity: kind.default_severity(),
            retryable: kind.is_retryable(),
            message: error.to_string(),
        }
    }
}
