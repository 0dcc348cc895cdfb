use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Allowed deviation of a model distribution from 1.0.
pub const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(pub String);

impl DetectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical species identifier. Independent of any raw label spelling.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeciesId(String);

impl SpeciesId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeciesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Locale & Severity
// ============================================================================

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    English,
    Bangla,
    Hindi,
}

impl Locale {
    pub const DEFAULT: Locale = Locale::English;
    pub const ALL: [Locale; 3] = [Locale::English, Locale::Bangla, Locale::Hindi];

    pub fn as_str(self) -> &'static str {
        match self {
            Locale::English => "english",
            Locale::Bangla => "bangla",
            Locale::Hindi => "hindi",
        }
    }

    /// Case-insensitive parse of a locale code.
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|locale| locale.as_str().eq_ignore_ascii_case(code))
    }

    /// Unknown codes silently map to the default locale.
    pub fn parse_or_default(code: &str) -> Self {
        Self::parse(code).unwrap_or(Self::DEFAULT)
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    VeryHigh,
}

// ============================================================================
// Classification Result
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DistributionError {
    #[error("model produced an empty distribution")]
    Empty,

    #[error("distribution length {got} does not match class count {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("probability at index {index} is not finite")]
    NonFinite { index: usize },

    #[error("probability at index {index} outside [0, 1]: {value}")]
    OutOfRange { index: usize, value: f32 },

    #[error("distribution sums to {sum}, expected 1.0 within {PROBABILITY_SUM_TOLERANCE}")]
    NotNormalized { sum: f32 },
}

/// Output of one inference call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct ClassificationResult {
    raw_label: String,
    top_index: usize,
    probabilities: Vec<f32>,
    class_count: usize,
}

impl ClassificationResult {
    /// Validates a model distribution against the ordered class labels and
    /// picks the arg-max label. Ties go to the lowest index.
    pub fn from_distribution(
        labels: &[String],
        probabilities: Vec<f32>,
    ) -> Result<Self, DistributionError> {
        if probabilities.is_empty() {
            return Err(DistributionError::Empty);
        }
        if probabilities.len() != labels.len() {
            return Err(DistributionError::LengthMismatch {
                expected: labels.len(),
                got: probabilities.len(),
            });
        }
        validate_distribution(&probabilities)?;

        let top_index = probabilities
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |(best_idx, best), (idx, &p)| {
                if p > best {
                    (idx, p)
                } else {
                    (best_idx, best)
                }
            })
            .0;

        Ok(Self {
            raw_label: labels[top_index].clone(),
            top_index,
            class_count: probabilities.len(),
            probabilities,
        })
    }

    pub fn raw_label(&self) -> &str {
        &self.raw_label
    }

    pub fn top_index(&self) -> usize {
        self.top_index
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Probability of the top label in `[0, 1]`.
    pub fn confidence(&self) -> f32 {
        self.probabilities[self.top_index]
    }

    /// Top-label confidence on the 0-100 scale, two-decimal rounding.
    pub fn confidence_percent(&self) -> f64 {
        to_percent(self.confidence())
    }
}

/// Checks range and normalization of a probability vector.
pub fn validate_distribution(probabilities: &[f32]) -> Result<(), DistributionError> {
    if probabilities.is_empty() {
        return Err(DistributionError::Empty);
    }

    let mut sum = 0.0f64;
    for (index, &value) in probabilities.iter().enumerate() {
        if !value.is_finite() {
            return Err(DistributionError::NonFinite { index });
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(DistributionError::OutOfRange { index, value });
        }
        sum += f64::from(value);
    }

    if (sum - 1.0).abs() > f64::from(PROBABILITY_SUM_TOLERANCE) {
        return Err(DistributionError::NotNormalized { sum: sum as f32 });
    }
    Ok(())
}

/// Converts a probability to a percentage rounded to two decimals.
pub fn to_percent(probability: f32) -> f64 {
    (f64::from(probability) * 100.0 * 100.0).round() / 100.0
}

// ============================================================================
// Storage & Detection Records
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Remote,
    Local,
}

/// Where the uploaded image ended up. Remote is always attempted first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "lowercase")]
pub enum StorageReference {
    /// Absolute URL returned by the object store.
    Remote { url: String },
    /// Path relative to the configured upload root.
    Local { path: String },
    /// Both tiers failed; the detection is kept without an image.
    None,
}

impl StorageReference {
    pub fn tier(&self) -> Option<StorageTier> {
        match self {
            StorageReference::Remote { .. } => Some(StorageTier::Remote),
            StorageReference::Local { .. } => Some(StorageTier::Local),
            StorageReference::None => None,
        }
    }

    pub fn url_or_path(&self) -> Option<&str> {
        match self {
            StorageReference::Remote { url } => Some(url),
            StorageReference::Local { path } => Some(path),
            StorageReference::None => None,
        }
    }
}

/// Append-only history entry for one detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: DetectionId,
    /// `None` when the raw label could not be resolved.
    pub species_id: Option<SpeciesId>,
    pub raw_label: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
    pub image_reference: StorageReference,
    /// BLAKE3 hex digest of the uploaded bytes.
    pub image_digest: String,
    pub created_at: UnixTimeMs,
    pub locale_used: Locale,
}

impl DetectionRecord {
    pub fn confidence_percent(&self) -> f64 {
        to_percent(self.confidence)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounter {
    pub species_id: SpeciesId,
    pub detection_count: u64,
    pub last_detected_at: UnixTimeMs,
}
