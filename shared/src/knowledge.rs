//! Locale-keyed pest knowledge with deterministic fallback.
//!
//! The asset is parsed and validated once; after construction the index is
//! read-only and can be shared freely across request tasks.

use std::collections::HashMap;
use std::path::Path;

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Locale, Severity, SpeciesId};
use crate::resolver::{Resolution, SpeciesCatalog};

const EMBEDDED_ASSET: &str = include_str!("../data/knowledge.json");

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("failed to read knowledge asset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed knowledge asset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate record for {species_id} ({locale})")]
    Duplicate { species_id: String, locale: Locale },

    #[error("{species_id} has a {locale} record but no {default} record")]
    MissingDefault {
        species_id: String,
        locale: Locale,
        default: Locale,
    },

    #[error("record {species_id} ({locale}) has empty {field}")]
    EmptyField {
        species_id: String,
        locale: Locale,
        field: &'static str,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    #[default]
    Authored,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// Canonical species; `None` only on records synthesized for an
    /// unresolved label.
    #[serde(default)]
    pub species_id: Option<SpeciesId>,
    pub locale: Locale,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scientific_name: Option<String>,
    pub description: String,
    pub harmful_effects: Vec<String>,
    pub organic_solutions: Vec<String>,
    pub chemical_treatments: Vec<String>,
    pub prevention_methods: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub origin: RecordOrigin,
}

impl KnowledgeRecord {
    fn validate(&self) -> Result<(), KnowledgeError> {
        let fields: [(&'static str, bool); 6] = [
            ("name", self.name.trim().is_empty()),
            ("description", self.description.trim().is_empty()),
            ("harmful_effects", is_blank(&self.harmful_effects)),
            ("organic_solutions", is_blank(&self.organic_solutions)),
            ("chemical_treatments", is_blank(&self.chemical_treatments)),
            ("prevention_methods", is_blank(&self.prevention_methods)),
        ];

        match fields.into_iter().find(|(_, empty)| *empty) {
            Some((field, _)) => Err(KnowledgeError::EmptyField {
                species_id: self.species_label(),
                locale: self.locale,
                field,
            }),
            None => Ok(()),
        }
    }

    fn species_label(&self) -> String {
        self.species_id
            .as_ref()
            .map_or_else(String::new, ToString::to_string)
    }
}

fn is_blank(items: &[String]) -> bool {
    items.is_empty() || items.iter().any(|item| item.trim().is_empty())
}

#[derive(Deserialize)]
struct KnowledgeAsset {
    #[serde(default)]
    default_locale: Locale,
    records: Vec<KnowledgeRecord>,
}

// ============================================================================
// Knowledge Base
// ============================================================================

#[derive(Clone, Debug)]
pub struct KnowledgeBase {
    default_locale: Locale,
    index: HashMap<(SpeciesId, Locale), KnowledgeRecord>,
}

impl KnowledgeBase {
    /// The asset compiled into the library.
    pub fn embedded() -> Result<Self, KnowledgeError> {
        Self::from_json(EMBEDDED_ASSET)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| KnowledgeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, KnowledgeError> {
        let asset: KnowledgeAsset = serde_json::from_str(json)?;
        Self::from_records(asset.default_locale, asset.records)
    }

    pub fn from_records(
        default_locale: Locale,
        records: Vec<KnowledgeRecord>,
    ) -> Result<Self, KnowledgeError> {
        let mut index = HashMap::with_capacity(records.len());

        for mut record in records {
            record.validate()?;
            let species_id =
                record
                    .species_id
                    .clone()
                    .ok_or_else(|| KnowledgeError::EmptyField {
                        species_id: String::new(),
                        locale: record.locale,
                        field: "species_id",
                    })?;
            record.origin = RecordOrigin::Authored;
            let key = (species_id, record.locale);
            if index.contains_key(&key) {
                return Err(KnowledgeError::Duplicate {
                    species_id: record.species_label(),
                    locale: record.locale,
                });
            }
            index.insert(key, record);
        }

        if let Some((species_id, locale)) = index
            .keys()
            .find(|(id, _)| !index.contains_key(&(id.clone(), default_locale)))
        {
            return Err(KnowledgeError::MissingDefault {
                species_id: species_id.to_string(),
                locale: *locale,
                default: default_locale,
            });
        }

        info!(records = index.len(), %default_locale, "knowledge base loaded");

        Ok(Self {
            default_locale,
            index,
        })
    }

    pub fn default_locale(&self) -> Locale {
        self.default_locale
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Authored record for exactly this key, without fallback.
    pub fn get(&self, species_id: &SpeciesId, locale: Locale) -> Option<&KnowledgeRecord> {
        self.index.get(&(species_id.clone(), locale))
    }

    /// Exact record, then the default-locale record, then a synthesized one.
    ///
    /// `raw_label` and `confidence_percent` only feed the synthesized record.
    pub fn lookup(
        &self,
        species_id: Option<&SpeciesId>,
        raw_label: &str,
        confidence_percent: f64,
        locale: Locale,
    ) -> KnowledgeRecord {
        if let Some(id) = species_id {
            if let Some(record) = self.get(id, locale) {
                return record.clone();
            }
            if let Some(record) = self.get(id, self.default_locale) {
                debug!(species_id = %id, requested = %locale, "locale missing, using default");
                return record.clone();
            }
        }

        counter!("knowledge.fallback").increment(1);
        debug!(raw_label, "synthesizing fallback knowledge record");
        self.fallback(species_id, raw_label, confidence_percent)
    }

    pub fn lookup_resolution(
        &self,
        resolution: &Resolution,
        confidence_percent: f64,
        locale: Locale,
    ) -> KnowledgeRecord {
        self.lookup(
            resolution.species_id(),
            resolution.raw_label(),
            confidence_percent,
            locale,
        )
    }

    /// One record per catalog species, in catalog order.
    pub fn library(&self, catalog: &SpeciesCatalog, locale: Locale) -> Vec<KnowledgeRecord> {
        catalog
            .iter()
            .map(|species| {
                self.lookup(Some(&species.id), &species.display_name, 100.0, locale)
            })
            .collect()
    }

    fn fallback(
        &self,
        species_id: Option<&SpeciesId>,
        raw_label: &str,
        confidence_percent: f64,
    ) -> KnowledgeRecord {
        let label = raw_label.trim();
        let summary = format!("AI detected {label} with {confidence_percent:.1}% confidence.");
        let description = match generic_description(label) {
            Some(generic) => format!("{generic} {summary}"),
            None => summary,
        };

        KnowledgeRecord {
            species_id: species_id.cloned(),
            locale: self.default_locale,
            name: label.to_string(),
            scientific_name: None,
            description,
            harmful_effects: to_owned(FALLBACK_HARMS),
            organic_solutions: to_owned(FALLBACK_ORGANIC),
            chemical_treatments: to_owned(FALLBACK_CHEMICAL),
            prevention_methods: to_owned(FALLBACK_PREVENTION),
            severity: Severity::Medium,
            origin: RecordOrigin::Fallback,
        }
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// ============================================================================
// Fallback content
// ============================================================================

const GENERIC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("Aphid", "Small sap-sucking insects that can cause significant damage to plants."),
    ("Whitefly", "Tiny white flying insects that feed on plant sap and transmit diseases."),
    ("Caterpillar", "Larval stage of butterflies and moths that chew on leaves."),
    ("Beetle", "Hard-shelled insects that can damage leaves, stems, and roots."),
    ("Mite", "Microscopic arachnids that feed on plant cells."),
    ("Thrips", "Slender insects that scrape plant surfaces to feed on cell contents."),
    ("Mealybug", "Small, soft-bodied insects covered with a white waxy powder."),
    ("Scale", "Immobile insects that attach themselves to plants and feed on sap."),
    ("Leafhopper", "Small insects that feed on plant sap and can transmit diseases."),
    ("Spider Mite", "Tiny mites that create fine webs on plants and feed on cell contents."),
];

const FALLBACK_HARMS: &[&str] = &[
    "Damages crops and reduces yield",
    "Affects plant health and growth",
    "Can spread to other plants",
    "May transmit plant diseases",
];

const FALLBACK_ORGANIC: &[&str] = &[
    "Use neem oil spray",
    "Practice crop rotation",
    "Use beneficial insects like ladybugs",
    "Apply insecticidal soap",
    "Use companion planting",
];

const FALLBACK_CHEMICAL: &[&str] = &[
    "Consult agricultural expert for specific pesticides",
    "Follow recommended dosage instructions",
    "Use protective equipment when applying",
    "Rotate pesticides to prevent resistance",
];

const FALLBACK_PREVENTION: &[&str] = &[
    "Regular field monitoring",
    "Maintain field hygiene",
    "Use resistant plant varieties",
    "Remove infected plants promptly",
    "Practice proper irrigation",
];

fn generic_description(label: &str) -> Option<&'static str> {
    GENERIC_DESCRIPTIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, description)| *description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kb() -> KnowledgeBase {
        KnowledgeBase::embedded().unwrap()
    }

    fn record(species: &str, locale: Locale) -> KnowledgeRecord {
        KnowledgeRecord {
            species_id: Some(SpeciesId::new(species)),
            locale,
            name: species.to_string(),
            scientific_name: None,
            description: format!("{species} in {locale}"),
            harmful_effects: vec!["harm".into()],
            organic_solutions: vec!["organic".into()],
            chemical_treatments: vec!["chemical".into()],
            prevention_methods: vec!["prevent".into()],
            severity: Severity::High,
            origin: RecordOrigin::Authored,
        }
    }

    #[test]
    fn embedded_asset_covers_catalog_in_every_locale() {
        let kb = kb();
        let catalog = SpeciesCatalog::builtin().unwrap();
        assert_eq!(kb.len(), 33);
        for species in catalog.iter() {
            for locale in Locale::ALL {
                assert!(kb.get(&species.id, locale).is_some(), "{} {}", species.id, locale);
            }
        }
    }

    #[test]
    fn army_worms_alias_has_very_high_english_record() {
        let catalog = SpeciesCatalog::builtin().unwrap();
        let resolution = catalog.resolve("Army Worms");

        let record = kb().lookup_resolution(&resolution, 91.2, Locale::English);

        assert_eq!(record.species_id, Some(SpeciesId::new("Armyworms Group")));
        assert_eq!(record.severity, Severity::VeryHigh);
        assert_eq!(record.origin, RecordOrigin::Authored);
        assert!(!record.harmful_effects.is_empty());
    }

    #[test]
    fn unknown_label_synthesizes_fallback() {
        let catalog = SpeciesCatalog::builtin().unwrap();
        let resolution = catalog.resolve("Unknown");

        let record = kb().lookup_resolution(&resolution, 42.0, Locale::Hindi);

        assert_eq!(record.origin, RecordOrigin::Fallback);
        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.locale, Locale::English);
        assert_eq!(record.description, "AI detected Unknown with 42.0% confidence.");
        assert_eq!(record.organic_solutions.len(), 5);
        assert_eq!(record.species_id, None);
    }

    #[test]
    fn rejects_record_without_species() {
        let mut bad = record("Fruit Flies", Locale::English);
        bad.species_id = None;
        let result = KnowledgeBase::from_records(Locale::English, vec![bad]);
        assert!(matches!(
            result,
            Err(KnowledgeError::EmptyField { field: "species_id", .. })
        ));
    }

    #[test]
    fn fallback_embeds_generic_description() {
        let record = kb().lookup(None, "aphid", 77.77, Locale::English);
        assert!(record.description.starts_with("Small sap-sucking insects"));
        assert!(record.description.ends_with("AI detected aphid with 77.8% confidence."));
    }

    #[test]
    fn missing_locale_falls_back_to_default() {
        let kb = KnowledgeBase::from_records(
            Locale::English,
            vec![record("Fruit Flies", Locale::English)],
        )
        .unwrap();

        let record = kb.lookup(Some(&SpeciesId::new("Fruit Flies")), "Fruit Flies", 80.0, Locale::Bangla);

        assert_eq!(record.locale, Locale::English);
        assert_eq!(record.origin, RecordOrigin::Authored);
    }

    #[test]
    fn known_species_without_any_record_gets_fallback() {
        let kb = KnowledgeBase::from_records(Locale::English, vec![]).unwrap();
        let id = SpeciesId::new("Citrus Canker");

        let record = kb.lookup(Some(&id), "Citrus Canker", 60.0, Locale::English);

        assert_eq!(record.species_id, Some(id));
        assert_eq!(record.origin, RecordOrigin::Fallback);
    }

    #[test]
    fn rejects_locale_without_default_record() {
        let result = KnowledgeBase::from_records(
            Locale::English,
            vec![record("Fruit Flies", Locale::Hindi)],
        );
        assert!(matches!(result, Err(KnowledgeError::MissingDefault { .. })));
    }

    #[test]
    fn rejects_empty_lists() {
        let mut bad = record("Fruit Flies", Locale::English);
        bad.prevention_methods.clear();
        let result = KnowledgeBase::from_records(Locale::English, vec![bad]);
        assert!(matches!(
            result,
            Err(KnowledgeError::EmptyField { field: "prevention_methods", .. })
        ));
    }

    #[test]
    fn rejects_duplicates() {
        let result = KnowledgeBase::from_records(
            Locale::English,
            vec![record("A", Locale::English), record("A", Locale::English)],
        );
        assert!(matches!(result, Err(KnowledgeError::Duplicate { .. })));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            KnowledgeBase::from_json("{\"records\": 3}"),
            Err(KnowledgeError::Parse(_))
        ));
    }

    #[test]
    fn library_is_in_catalog_order() {
        let catalog = SpeciesCatalog::builtin().unwrap();
        let library = kb().library(&catalog, Locale::Bangla);

        assert_eq!(library.len(), 11);
        assert_eq!(library[0].species_id, Some(SpeciesId::new("Armyworms Group")));
        assert_eq!(library[10].species_id, Some(SpeciesId::new("Western Corn Rootworms")));
        assert!(library.iter().all(|r| r.locale == Locale::Bangla));
    }

    proptest! {
        #[test]
        fn lookup_lists_never_empty(number in 1u32..=11, locale_idx in 0usize..3, label in ".{0,20}") {
            let catalog = SpeciesCatalog::builtin().unwrap();
            let kb = kb();
            let locale = Locale::ALL[locale_idx];
            let species = catalog.resolve_number(number).unwrap();

            for record in [
                kb.lookup(Some(&species.id), &species.display_name, 50.0, locale),
                kb.lookup(None, &label, 50.0, locale),
            ] {
                prop_assert!(!record.harmful_effects.is_empty());
                prop_assert!(!record.organic_solutions.is_empty());
                prop_assert!(!record.chemical_treatments.is_empty());
                prop_assert!(!record.prevention_methods.is_empty());
            }
        }
    }
}
