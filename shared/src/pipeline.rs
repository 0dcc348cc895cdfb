//! End-to-end detection: bytes in, localized and persisted detection out.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::classifier::{ClassLabels, ClassificationEngine, ClassifyError, ModelBackend};
use crate::config::PipelineConfig;
use crate::detection_store::{DetectionStore, SqliteDetectionStore, StoreError};
use crate::image_processing::{ImagePreprocessor, ImageProcessingError};
use crate::knowledge::{KnowledgeBase, KnowledgeRecord};
use crate::localization::{LocalizationSelector, LocalizedView};
use crate::model::{
    to_percent, AggregateCounter, ClassificationResult, DetectionId, DetectionRecord, Locale,
    SpeciesId, StorageReference,
};
use crate::persister::{DetectionPersister, PersistError};
use crate::resolver::{Resolution, SpeciesCatalog};
use crate::storage::{HttpObjectStore, LocalUploadStore, ObjectStore, TieredImageStore};
use crate::ErrorKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed image: {0}")]
    Decode(#[source] ImageProcessingError),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid model output: {0}")]
    InvalidModelOutput(String),

    #[error("service overloaded, try again later")]
    Overloaded,

    #[error("failed to persist detection: {0}")]
    Persistence(String),

    #[error("detection not found: {0}")]
    NotFound(DetectionId),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::InvalidModelOutput(_) => ErrorKind::InvalidModelOutput,
            Self::Overloaded => ErrorKind::Overloaded,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Startup(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ImageProcessingError> for PipelineError {
    fn from(e: ImageProcessingError) -> Self {
        match e {
            ImageProcessingError::Aborted => Self::Internal(e.to_string()),
            other => Self::Decode(other),
        }
    }
}

impl From<ClassifyError> for PipelineError {
    fn from(e: ClassifyError) -> Self {
        match e {
            ClassifyError::Overloaded => Self::Overloaded,
            ClassifyError::InvalidOutput(inner) => Self::InvalidModelOutput(inner.to_string()),
            ClassifyError::Aborted => Self::Internal(e.to_string()),
            ClassifyError::ModelUnavailable(_)
            | ClassifyError::ClassMapping(_)
            | ClassifyError::InputMismatch { .. }
            | ClassifyError::Inference(_) => Self::ModelUnavailable(e.to_string()),
        }
    }
}

impl From<PersistError> for PipelineError {
    fn from(e: PersistError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e.to_string())
    }
}

// ============================================================================
// Response types
// ============================================================================

/// Classification summary consumed by presentation collaborators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InferenceOutput {
    pub resolved: bool,
    pub canonical_id: Option<SpeciesId>,
    pub raw_label: String,
    /// 0-100, two decimals.
    pub confidence: f64,
    /// Resolved display name of every class to its 0-100 score.
    pub all_class_scores: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResponse {
    pub detection_id: DetectionId,
    pub canonical_id: Option<SpeciesId>,
    pub confidence: f64,
    pub inference: InferenceOutput,
    pub view: LocalizedView,
    pub storage: StorageReference,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsReport {
    pub counters: Vec<AggregateCounter>,
    pub recent: Vec<DetectionRecord>,
}

// ============================================================================
// Read side
// ============================================================================

/// Stored detections, counters and the pest library. Opening one loads the
/// knowledge asset and the database but never the model.
pub struct DetectionReader {
    catalog: SpeciesCatalog,
    knowledge: KnowledgeBase,
    store: Arc<dyn DetectionStore>,
    uploads: LocalUploadStore,
}

impl DetectionReader {
    pub fn new(
        catalog: SpeciesCatalog,
        knowledge: KnowledgeBase,
        store: Arc<dyn DetectionStore>,
        uploads: LocalUploadStore,
    ) -> Self {
        Self {
            catalog,
            knowledge,
            store,
            uploads,
        }
    }

    pub fn open(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Startup(e.to_string()))?;

        let catalog = SpeciesCatalog::builtin().map_err(|e| PipelineError::Startup(e.to_string()))?;
        let knowledge = match &config.knowledge.path {
            Some(path) => KnowledgeBase::from_path(path),
            None => KnowledgeBase::embedded(),
        }
        .map_err(|e| PipelineError::Startup(e.to_string()))?;
        let store = SqliteDetectionStore::open(&config.database.path)
            .map_err(|e| PipelineError::Startup(e.to_string()))?;

        Ok(Self::new(
            catalog,
            knowledge,
            Arc::new(store),
            LocalUploadStore::new(&config.storage.upload_root),
        ))
    }

    pub fn catalog(&self) -> &SpeciesCatalog {
        &self.catalog
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn store(&self) -> &Arc<dyn DetectionStore> {
        &self.store
    }

    /// Filesystem location of a local-tier image.
    pub fn image_path(&self, reference: &StorageReference) -> Option<PathBuf> {
        match reference {
            StorageReference::Local { path } => Some(self.uploads.resolve(path)),
            StorageReference::Remote { .. } | StorageReference::None => None,
        }
    }

    /// Re-renders a stored detection in the requested locale.
    pub async fn view(
        &self,
        id: &DetectionId,
        requested_locale: &str,
    ) -> Result<LocalizedView, PipelineError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.clone()))?;
        Ok(LocalizationSelector::new(&self.knowledge).localize(&record, requested_locale))
    }

    pub async fn stats(&self, recent: usize) -> Result<StatsReport, PipelineError> {
        Ok(StatsReport {
            counters: self.store.counters().await?,
            recent: self.store.recent(recent).await?,
        })
    }

    /// Knowledge for every catalog species in the requested locale.
    pub fn library(&self, requested_locale: &str) -> Vec<KnowledgeRecord> {
        let locale = Locale::parse(requested_locale).unwrap_or_else(|| {
            warn!(requested_locale, "unknown locale, using default");
            self.knowledge.default_locale()
        });
        self.knowledge.library(&self.catalog, locale)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    preprocessor: ImagePreprocessor,
    engine: ClassificationEngine,
    persister: DetectionPersister,
    reader: DetectionReader,
}

impl Pipeline {
    pub fn new(
        preprocessor: ImagePreprocessor,
        engine: ClassificationEngine,
        persister: DetectionPersister,
        reader: DetectionReader,
    ) -> Self {
        Self {
            preprocessor,
            engine,
            persister,
            reader,
        }
    }

    /// Loads the ONNX model named in the config and wires every component.
    #[cfg(feature = "ml")]
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let labels = load_labels(config)?;
        let engine = ClassificationEngine::load_onnx(
            &config.model.path,
            labels,
            config.model.input_size,
            config.model.max_queued,
        )?;
        Self::assemble(config, engine)
    }

    /// Same wiring as `from_config` around an already-loaded backend.
    pub fn with_backend(
        config: &PipelineConfig,
        backend: Box<dyn ModelBackend>,
    ) -> Result<Self, PipelineError> {
        let labels = load_labels(config)?;
        let engine = ClassificationEngine::new(backend, labels, config.model.max_queued);
        Self::assemble(config, engine)
    }

    fn assemble(config: &PipelineConfig, engine: ClassificationEngine) -> Result<Self, PipelineError> {
        let reader = DetectionReader::open(config)?;

        let remote = match &config.storage.remote {
            Some(remote) => {
                let store = HttpObjectStore::new(
                    &remote.endpoint,
                    &remote.public_base_url,
                    remote.token(),
                    config.storage.remote_timeout(),
                )
                .map_err(|e| PipelineError::Startup(e.to_string()))?;
                Some(Arc::new(store) as Arc<dyn ObjectStore>)
            }
            None => None,
        };
        let folder = config
            .storage
            .remote
            .as_ref()
            .map_or(crate::storage::DEFAULT_REMOTE_FOLDER, |r| r.folder.as_str());
        let images = TieredImageStore::new(
            remote,
            folder,
            config.storage.remote_timeout(),
            LocalUploadStore::new(&config.storage.upload_root),
        );
        let persister = DetectionPersister::new(images, Arc::clone(reader.store()));

        info!(
            classes = engine.labels().len(),
            species = reader.catalog().len(),
            knowledge_records = reader.knowledge().len(),
            "pipeline ready"
        );

        Ok(Self::new(
            ImagePreprocessor::new(config.preprocess_config()),
            engine,
            persister,
            reader,
        ))
    }

    /// Read-side operations over the same store and knowledge.
    pub fn reader(&self) -> &DetectionReader {
        &self.reader
    }

    /// Unknown locale codes silently use the default locale.
    #[instrument(skip(self, image_bytes), fields(size = image_bytes.len()))]
    pub async fn detect(
        &self,
        image_bytes: Arc<[u8]>,
        requested_locale: &str,
    ) -> Result<DetectionResponse, PipelineError> {
        let start = Instant::now();

        let tensor = self.preprocessor.preprocess(Arc::clone(&image_bytes)).await?;
        let classification = self.engine.classify(tensor).await?;
        let resolution = self.reader.catalog.resolve(classification.raw_label());

        let locale = Locale::parse(requested_locale)
            .unwrap_or_else(|| self.reader.knowledge.default_locale());
        let knowledge: KnowledgeRecord = self.reader.knowledge.lookup_resolution(
            &resolution,
            classification.confidence_percent(),
            locale,
        );

        let record = self
            .persister
            .persist(&classification, &resolution, &knowledge, image_bytes)
            .await?;

        let view =
            LocalizationSelector::new(&self.reader.knowledge).localize(&record, requested_locale);
        let inference = self.inference_output(&classification, &resolution);

        histogram!("pipeline.detect_ms").record(start.elapsed().as_millis() as f64);
        info!(
            detection_id = %record.id,
            raw_label = classification.raw_label(),
            resolved = resolution.is_resolved(),
            confidence = inference.confidence,
            "detection complete"
        );

        Ok(DetectionResponse {
            detection_id: record.id.clone(),
            canonical_id: record.species_id.clone(),
            confidence: inference.confidence,
            storage: record.image_reference.clone(),
            inference,
            view,
        })
    }

    fn inference_output(
        &self,
        classification: &ClassificationResult,
        resolution: &Resolution,
    ) -> InferenceOutput {
        let mut all_class_scores = BTreeMap::new();
        for (label, &probability) in self
            .engine
            .labels()
            .as_slice()
            .iter()
            .zip(classification.probabilities())
        {
            let name = self.reader.catalog.resolve(label).display_name().to_string();
            all_class_scores.entry(name).or_insert(to_percent(probability));
        }

        InferenceOutput {
            resolved: resolution.is_resolved(),
            canonical_id: resolution.species_id().cloned(),
            raw_label: classification.raw_label().to_string(),
            confidence: classification.confidence_percent(),
            all_class_scores,
        }
    }
}

fn load_labels(config: &PipelineConfig) -> Result<ClassLabels, PipelineError> {
    match &config.model.class_mapping {
        Some(path) => ClassLabels::from_mapping_path(path),
        None => ClassLabels::bundled(),
    }
    .map_err(|e| PipelineError::ModelUnavailable(e.to_string()))
}
