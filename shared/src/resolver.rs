//! Maps raw classifier labels onto canonical species identities.
//!
//! Resolution is an ordered list of match strategies; the first hit wins and
//! the outcome is a pure function of the label and the catalog.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::model::SpeciesId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate species id: {0}")]
    DuplicateId(String),

    #[error("duplicate catalog number: {0}")]
    DuplicateNumber(u32),

    #[error("alias {alias:?} claimed by both {first} and {second}")]
    AmbiguousAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("empty species id")]
    EmptyId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CanonicalSpecies {
    pub id: SpeciesId,
    pub display_name: String,
    pub aliases: BTreeSet<String>,
    /// 1-based position in the published catalog.
    pub catalog_number: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStep {
    ExactId,
    CaseInsensitive,
    Alias,
    Substring,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnresolvedMarker {
    pub raw_label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Resolved {
        species: CanonicalSpecies,
        raw_label: String,
        step: MatchStep,
    },
    Unresolved(UnresolvedMarker),
}

impl Resolution {
    pub fn species_id(&self) -> Option<&SpeciesId> {
        match self {
            Self::Resolved { species, .. } => Some(&species.id),
            Self::Unresolved(_) => None,
        }
    }

    pub fn species(&self) -> Option<&CanonicalSpecies> {
        match self {
            Self::Resolved { species, .. } => Some(species),
            Self::Unresolved(_) => None,
        }
    }

    pub fn raw_label(&self) -> &str {
        match self {
            Self::Resolved { raw_label, .. } => raw_label,
            Self::Unresolved(marker) => &marker.raw_label,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    /// Canonical display name, or the raw label when unresolved.
    pub fn display_name(&self) -> &str {
        match self {
            Self::Resolved { species, .. } => &species.display_name,
            Self::Unresolved(marker) => &marker.raw_label,
        }
    }
}

// ============================================================================
// Catalog
// ============================================================================

const BUILTIN: &[(&str, &[&str])] = &[
    ("Armyworms Group", &["Armyworms", "Army Worms", "Army worm"]),
    ("Corn Worms Group", &["Corn Worms", "Cornworms", "Corn worm"]),
    (
        "Small Sap-Sucking Pests",
        &["Small Sap Sucking Pests", "Sap Sucking Pests", "Sap-sucking pests"],
    ),
    (
        "Africanized Honey Bees (Killer Bees)",
        &["Africanized Honey Bees", "Killer Bees", "Africanized bees"],
    ),
    (
        "Brown Marmorated Stink Bugs",
        &["Brown Marmorated Stink Bug", "Stink Bugs", "Stink bug"],
    ),
    ("Cabbage Loopers", &["Cabbage Looper"]),
    ("Citrus Canker", &["Citrus canker"]),
    (
        "Colorado Potato Beetles",
        &["Colorado Potato Beetle", "Potato Beetles"],
    ),
    ("Fruit Flies", &["Fruit Fly", "Fruitflies"]),
    ("Tomato Hornworms", &["Tomato Hornworm", "Hornworms"]),
    (
        "Western Corn Rootworms",
        &["Western Corn Rootworm", "Corn Rootworms"],
    ),
];

/// Immutable set of canonical species with their aliases.
#[derive(Clone, Debug)]
pub struct SpeciesCatalog {
    species: BTreeMap<SpeciesId, CanonicalSpecies>,
    aliases: BTreeMap<String, SpeciesId>,
    by_number: BTreeMap<u32, SpeciesId>,
}

impl SpeciesCatalog {
    pub fn new(entries: Vec<CanonicalSpecies>) -> Result<Self, CatalogError> {
        let mut species = BTreeMap::new();
        let mut aliases: BTreeMap<String, SpeciesId> = BTreeMap::new();
        let mut by_number = BTreeMap::new();

        for entry in entries {
            if entry.id.as_str().trim().is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if species.contains_key(&entry.id) {
                return Err(CatalogError::DuplicateId(entry.id.to_string()));
            }
            if by_number.insert(entry.catalog_number, entry.id.clone()).is_some() {
                return Err(CatalogError::DuplicateNumber(entry.catalog_number));
            }
            for alias in &entry.aliases {
                if let Some(existing) = aliases.get(alias) {
                    if existing != &entry.id {
                        return Err(CatalogError::AmbiguousAlias {
                            alias: alias.clone(),
                            first: existing.to_string(),
                            second: entry.id.to_string(),
                        });
                    }
                }
                aliases.insert(alias.clone(), entry.id.clone());
            }
            species.insert(entry.id.clone(), entry);
        }

        Ok(Self {
            species,
            aliases,
            by_number,
        })
    }

    /// The eleven species the shipped model was trained on.
    pub fn builtin() -> Result<Self, CatalogError> {
        let entries = BUILTIN
            .iter()
            .zip(1u32..)
            .map(|((name, aliases), number)| CanonicalSpecies {
                id: SpeciesId::new(*name),
                display_name: (*name).to_string(),
                aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
                catalog_number: number,
            })
            .collect();
        Self::new(entries)
    }

    pub fn get(&self, id: &SpeciesId) -> Option<&CanonicalSpecies> {
        self.species.get(id)
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// Species in catalog-number order.
    pub fn iter(&self) -> impl Iterator<Item = &CanonicalSpecies> {
        self.by_number.values().filter_map(|id| self.species.get(id))
    }

    pub fn resolve_number(&self, number: u32) -> Option<&CanonicalSpecies> {
        self.by_number.get(&number).and_then(|id| self.species.get(id))
    }

    pub fn resolve(&self, raw_label: &str) -> Resolution {
        let label = raw_label.trim();
        if label.is_empty() {
            return self.unresolved(raw_label);
        }

        if let Some(species) = self.species.get(&SpeciesId::new(label)) {
            return resolved(species, raw_label, MatchStep::ExactId);
        }

        let lowered = label.to_lowercase();

        if let Some(species) = self.species.values().find(|s| {
            s.id.as_str().to_lowercase() == lowered || s.display_name.to_lowercase() == lowered
        }) {
            return resolved(species, raw_label, MatchStep::CaseInsensitive);
        }

        if let Some(species) = self.aliases.get(label).and_then(|id| self.species.get(id)) {
            return resolved(species, raw_label, MatchStep::Alias);
        }

        // BTreeMap iteration is id-ordered, so the first hit is the smallest id.
        if let Some(species) = self.species.values().find(|s| {
            let name = s.display_name.to_lowercase();
            name.contains(&lowered) || lowered.contains(&name)
        }) {
            return resolved(species, raw_label, MatchStep::Substring);
        }

        self.unresolved(raw_label)
    }

    fn unresolved(&self, raw_label: &str) -> Resolution {
        debug!(raw_label, "label did not resolve to a catalog species");
        Resolution::Unresolved(UnresolvedMarker {
            raw_label: raw_label.trim().to_string(),
        })
    }
}

fn resolved(species: &CanonicalSpecies, raw_label: &str, step: MatchStep) -> Resolution {
    Resolution::Resolved {
        species: species.clone(),
        raw_label: raw_label.trim().to_string(),
        step,
    }
}
