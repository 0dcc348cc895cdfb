use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::detection_store::{DetectionStore, StoreError};
use crate::knowledge::KnowledgeRecord;
use crate::model::{ClassificationResult, DetectionId, DetectionRecord, UnixTimeMs};
use crate::resolver::Resolution;
use crate::storage::TieredImageStore;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to record detection: {0}")]
    Store(#[from] StoreError),
}

/// Records detections with at-least-once semantics. Every call is a new
/// detection; nothing is deduplicated.
pub struct DetectionPersister {
    images: TieredImageStore,
    store: Arc<dyn DetectionStore>,
}

impl DetectionPersister {
    pub fn new(images: TieredImageStore, store: Arc<dyn DetectionStore>) -> Self {
        Self { images, store }
    }

    /// Image write (remote, then local), then the record insert, then the
    /// species counter. Only the insert can fail the call.
    #[instrument(skip_all, fields(raw_label = classification.raw_label(), resolved = resolution.is_resolved()))]
    pub async fn persist(
        &self,
        classification: &ClassificationResult,
        resolution: &Resolution,
        knowledge: &KnowledgeRecord,
        image_bytes: Arc<[u8]>,
    ) -> Result<DetectionRecord, PersistError> {
        let id = DetectionId::generate();
        let image_digest = blake3::hash(&image_bytes).to_hex().to_string();
        let image_reference = self.images.store(&id, image_bytes).await;

        let record = DetectionRecord {
            id,
            species_id: resolution.species_id().cloned(),
            raw_label: classification.raw_label().to_string(),
            confidence: classification.confidence(),
            probabilities: classification.probabilities().to_vec(),
            image_reference,
            image_digest,
            created_at: UnixTimeMs::now(),
            locale_used: knowledge.locale,
        };

        self.store.insert(&record).await.map_err(|e| {
            counter!("persist.insert_failures").increment(1);
            error!(error = %e, detection_id = %record.id, "detection insert failed");
            e
        })?;

        if let Some(species_id) = &record.species_id {
            match self.store.increment_counter(species_id, record.created_at).await {
                Ok(counter) => debug!(
                    species_id = %species_id,
                    detection_count = counter.detection_count,
                    "species counter incremented"
                ),
                Err(e) => {
                    counter!("persist.counter_failures").increment(1);
                    error!(error = %e, species_id = %species_id, "species counter update failed");
                }
            }
        }

        counter!("persist.detections").increment(1);
        info!(
            detection_id = %record.id,
            tier = ?record.image_reference.tier(),
            "detection persisted"
        );
        Ok(record)
    }
}
