use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::image_processing::ImageTensor;
use crate::model::{ClassificationResult, DistributionError};

/// Inference calls allowed to wait behind the running one.
pub const DEFAULT_MAX_QUEUED: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid class mapping: {0}")]
    ClassMapping(String),

    #[error("invalid model output: {0}")]
    InvalidOutput(#[from] DistributionError),

    #[error("model input mismatch: expected {expected}, got {got}")]
    InputMismatch { expected: String, got: String },

    #[error("inference engine error")]
    Inference(String),

    #[error("inference queue full")]
    Overloaded,

    #[error("inference task aborted")]
    Aborted,
}

#[cfg(feature = "ml")]
impl From<ort::Error> for ClassifyError {
    fn from(e: ort::Error) -> Self {
        tracing::error!(error = %e, "ORT inference error");
        ClassifyError::Inference("internal inference error".into())
    }
}

// ============================================================================
// Class Labels
// ============================================================================

/// Ordered class list matching the model's output positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassLabels(Vec<String>);

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Result<Self, ClassifyError> {
        if labels.is_empty() {
            return Err(ClassifyError::ClassMapping("no classes".into()));
        }
        Ok(Self(labels))
    }

    /// Parses `{"0": "label", "1": "label", ...}`. Keys must be contiguous.
    pub fn from_mapping_json(json: &str) -> Result<Self, ClassifyError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)
            .map_err(|e| ClassifyError::ClassMapping(e.to_string()))?;

        let mut indexed = BTreeMap::new();
        for (key, label) in raw {
            let index: usize = key
                .trim()
                .parse()
                .map_err(|_| ClassifyError::ClassMapping(format!("non-numeric key {key:?}")))?;
            indexed.insert(index, label);
        }

        if let Some((position, (index, _))) = indexed
            .iter()
            .enumerate()
            .find(|(position, (index, _))| position != *index)
        {
            return Err(ClassifyError::ClassMapping(format!(
                "expected key {position}, found {index}"
            )));
        }

        Self::new(indexed.into_values().collect())
    }

    /// The mapping shipped with the pest model.
    pub fn bundled() -> Result<Self, ClassifyError> {
        Self::from_mapping_json(include_str!("../data/class_mapping.json"))
    }

    pub fn from_mapping_path(path: impl AsRef<Path>) -> Result<Self, ClassifyError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifyError::ModelUnavailable(format!("class mapping {}: {e}", path.display()))
        })?;
        Self::from_mapping_json(&json)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Backend
// ============================================================================

/// A loaded model. Implementations need not be re-entrant; the engine never
/// calls `infer` concurrently on the same backend.
pub trait ModelBackend: Send + 'static {
    /// Returns one probability per class, in class-list order.
    fn infer(&mut self, tensor: &ImageTensor) -> Result<Vec<f32>, ClassifyError>;
}

#[cfg(feature = "ml")]
pub use onnx::OnnxBackend;

#[cfg(feature = "ml")]
mod onnx {
    use ndarray::Array4;
    use ort::session::Session;
    use tracing::{debug, instrument};

    use super::{ClassifyError, ModelBackend};
    use crate::image_processing::{ImageTensor, CHANNELS};

    /// ONNX Runtime session over a channel-last `[1, H, W, 3]` classifier.
    pub struct OnnxBackend {
        session: Session,
        output_name: String,
        input_size: u32,
    }

    impl OnnxBackend {
        #[instrument(skip(model_bytes), fields(model_size = model_bytes.len()))]
        pub fn from_bytes(model_bytes: &[u8], input_size: u32) -> Result<Self, ClassifyError> {
            let session = Session::builder()?.commit_from_memory(model_bytes)?;

            let output_name = session
                .outputs()
                .first()
                .map(|output| output.name().to_string())
                .ok_or_else(|| ClassifyError::ModelUnavailable("model has no outputs".into()))?;

            debug!(input_size, output = %output_name, "model loaded");

            Ok(Self {
                session,
                output_name,
                input_size,
            })
        }
    }

    impl ModelBackend for OnnxBackend {
        fn infer(&mut self, tensor: &ImageTensor) -> Result<Vec<f32>, ClassifyError> {
            if tensor.size() != self.input_size {
                return Err(ClassifyError::InputMismatch {
                    expected: format!("{0}x{0}", self.input_size),
                    got: format!("{0}x{0}", tensor.size()),
                });
            }

            let side = self.input_size as usize;
            let input = Array4::from_shape_vec((1, side, side, CHANNELS), tensor.data().to_vec())
                .map_err(|e| ClassifyError::Inference(e.to_string()))?;
            let input_value = ort::value::Value::from_array(input)?;

            let outputs = self.session.run(ort::inputs![input_value])?;

            let output = outputs
                .get(self.output_name.as_str())
                .ok_or_else(|| ClassifyError::Inference("model missing output node".into()))?;

            let (shape, data) = output.try_extract_tensor::<f32>()?;

            // [1, classes] or [classes]
            let batch = if shape.len() == 2 { shape[0] } else { 1 };
            if shape.is_empty() || shape.len() > 2 || batch != 1 {
                return Err(ClassifyError::Inference(format!(
                    "unexpected output shape {:?}",
                    &shape[..]
                )));
            }

            Ok(data.to_vec())
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Shared classifier. Loaded once per process; calls queue FIFO behind a
/// single backend and are rejected once the queue is full.
#[derive(Clone)]
pub struct ClassificationEngine {
    backend: Arc<Mutex<Box<dyn ModelBackend>>>,
    queue: Arc<Semaphore>,
    labels: Arc<ClassLabels>,
}

impl ClassificationEngine {
    pub fn new(backend: Box<dyn ModelBackend>, labels: ClassLabels, max_queued: usize) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            queue: Arc::new(Semaphore::new(max_queued.max(1))),
            labels: Arc::new(labels),
        }
    }

    /// Loads the ONNX artifact. Any failure here means the process must not
    /// serve requests.
    #[cfg(feature = "ml")]
    #[instrument(skip_all, fields(model = %model_path.as_ref().display()))]
    pub fn load_onnx(
        model_path: impl AsRef<Path>,
        labels: ClassLabels,
        input_size: u32,
        max_queued: usize,
    ) -> Result<Self, ClassifyError> {
        let model_path = model_path.as_ref();
        let bytes = std::fs::read(model_path).map_err(|e| {
            ClassifyError::ModelUnavailable(format!("{}: {e}", model_path.display()))
        })?;
        let backend = OnnxBackend::from_bytes(&bytes, input_size)
            .map_err(|e| ClassifyError::ModelUnavailable(e.to_string()))?;

        info!(classes = labels.len(), input_size, "classification engine ready");
        Ok(Self::new(Box::new(backend), labels, max_queued))
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    #[instrument(skip(self, tensor), fields(size = tensor.size()))]
    pub async fn classify(&self, tensor: ImageTensor) -> Result<ClassificationResult, ClassifyError> {
        let _slot = self.queue.try_acquire().map_err(|_| {
            counter!("classify.rejected").increment(1);
            ClassifyError::Overloaded
        })?;

        let wait_start = Instant::now();
        let mut backend = Arc::clone(&self.backend).lock_owned().await;
        histogram!("classify.queue_wait_ms").record(wait_start.elapsed().as_millis() as f64);

        let infer_start = Instant::now();
        let probabilities = tokio::task::spawn_blocking(move || backend.infer(&tensor))
            .await
            .map_err(|_| ClassifyError::Aborted)??;
        histogram!("classify.inference_ms").record(infer_start.elapsed().as_millis() as f64);

        let result = ClassificationResult::from_distribution(self.labels.as_slice(), probabilities)
            .map_err(|e| {
                counter!("classify.invalid_output").increment(1);
                warn!(error = %e, "model produced invalid distribution");
                ClassifyError::from(e)
            })?;

        debug!(
            raw_label = result.raw_label(),
            confidence = result.confidence(),
            "classification completed"
        );
        Ok(result)
    }
}
