use serde::Serialize;
use tracing::debug;

use crate::knowledge::{KnowledgeBase, KnowledgeRecord};
use crate::model::{DetectionId, DetectionRecord, Locale, SpeciesId, StorageReference, UnixTimeMs};

/// Locale-specific rendering of a stored detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalizedView {
    pub detection_id: DetectionId,
    pub species_id: Option<SpeciesId>,
    pub raw_label: String,
    pub confidence: f64,
    pub requested_locale: String,
    pub locale_used: Locale,
    pub knowledge: KnowledgeRecord,
    pub image_reference: StorageReference,
    pub created_at: UnixTimeMs,
}

/// Read-only view builder. Knowledge is looked up on every call, so asset
/// edits show up on historical detections.
#[derive(Clone, Copy)]
pub struct LocalizationSelector<'a> {
    knowledge: &'a KnowledgeBase,
}

impl<'a> LocalizationSelector<'a> {
    pub fn new(knowledge: &'a KnowledgeBase) -> Self {
        Self { knowledge }
    }

    /// Unknown locale codes fall back to the default locale.
    pub fn localize(&self, detection: &DetectionRecord, requested_locale: &str) -> LocalizedView {
        let locale = Locale::parse(requested_locale).unwrap_or_else(|| {
            debug!(requested_locale, "unknown locale, using default");
            self.knowledge.default_locale()
        });

        let knowledge = self.knowledge.lookup(
            detection.species_id.as_ref(),
            &detection.raw_label,
            detection.confidence_percent(),
            locale,
        );

        LocalizedView {
            detection_id: detection.id.clone(),
            species_id: detection.species_id.clone(),
            raw_label: detection.raw_label.clone(),
            confidence: detection.confidence_percent(),
            requested_locale: requested_locale.to_string(),
            locale_used: knowledge.locale,
            knowledge,
            image_reference: detection.image_reference.clone(),
            created_at: detection.created_at,
        }
    }
}
