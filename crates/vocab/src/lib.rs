//! Vocabulary lookups for CCDA coded elements.
//!
//! CCDA identifies a code system by OID (`codeSystem="2.16.840.1.113883.6.1"`), OMOP by
//! vocabulary id (`LOINC`). This crate provides both halves of the translation:
//!
//! - [`OidMap`]: OID → OMOP vocabulary id
//! - [`ConceptLookup`]: (vocabulary id, concept code) → [`Concept`]
//!
//! [`ConceptTable`] is an in-memory [`ConceptLookup`] loaded from an Athena `CONCEPT.csv`
//! export. The crate does not manage a vocabulary database; it only reads one.

mod concept;
mod oid;

use std::sync::Arc;

pub use concept::{Concept, ConceptLookup, ConceptTable};
pub use oid::OidMap;

/// Errors returned while loading vocabulary files.
#[derive(Debug, thiserror::Error)]
pub enum VocabError {
    #[error("I/O error reading {path}: {source}", path = path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid concept file: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid concept row: {0}")]
    InvalidRow(String),
}

/// Type alias for Results that can fail with a [`VocabError`].
pub type VocabResult<T> = Result<T, VocabError>;

/// OID map and concept lookup combined.
///
/// Cheap to clone; the concept store is shared.
#[derive(Clone)]
pub struct Vocabulary {
    oids: OidMap,
    concepts: Arc<dyn ConceptLookup>,
}

impl Vocabulary {
    pub fn new(oids: OidMap, concepts: Arc<dyn ConceptLookup>) -> Self {
        Self { oids, concepts }
    }

    /// Built-in OID map with no concepts loaded. Every concept lookup misses.
    pub fn without_concepts() -> Self {
        Self::new(OidMap::builtin(), Arc::new(ConceptTable::default()))
    }

    /// Returns the OMOP vocabulary id for a code-system OID.
    pub fn vocabulary_for_oid(&self, oid: &str) -> Option<&str> {
        self.oids.vocabulary_id(oid)
    }

    /// Looks up a concept by OMOP vocabulary id and concept code.
    pub fn lookup(&self, vocabulary_id: &str, concept_code: &str) -> Option<Concept> {
        self.concepts.lookup(vocabulary_id, concept_code)
    }

    /// Looks up a concept by code-system OID and concept code.
    pub fn concept_for_oid(&self, oid: &str, concept_code: &str) -> Option<Concept> {
        let vocabulary_id = self.vocabulary_for_oid(oid)?;
        let concept = self.lookup(vocabulary_id, concept_code);
        if concept.is_none() {
            tracing::debug!("no concept for {vocabulary_id}/{concept_code} (oid {oid})");
        }
        concept
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("oids", &self.oids)
            .finish_non_exhaustive()
    }
}
