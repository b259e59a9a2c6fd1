//! OMOP concept records and lookups.
//!
//! Athena exports `CONCEPT.csv` tab separated and unquoted, with a header row:
//!
//! ```text
//! concept_id  concept_name  domain_id  vocabulary_id  concept_class_id  standard_concept  concept_code  ...
//! ```
//!
//! Columns not listed on [`Concept`] are ignored.

use crate::{VocabError, VocabResult};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// One row of the OMOP `CONCEPT` table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Concept {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    #[serde(default)]
    pub standard_concept: Option<String>,
    pub concept_code: String,
}

impl Concept {
    pub fn new(
        concept_id: i64,
        concept_name: impl Into<String>,
        domain_id: impl Into<String>,
        vocabulary_id: impl Into<String>,
        concept_class_id: impl Into<String>,
        concept_code: impl Into<String>,
    ) -> Self {
        Self {
            concept_id,
            concept_name: concept_name.into(),
            domain_id: domain_id.into(),
            vocabulary_id: vocabulary_id.into(),
            concept_class_id: concept_class_id.into(),
            standard_concept: None,
            concept_code: concept_code.into(),
        }
    }
}

/// Lookup of concepts by vocabulary id and code.
pub trait ConceptLookup: Send + Sync {
    /// Returns the concept, or `None` when the code is not available.
    fn lookup(&self, vocabulary_id: &str, concept_code: &str) -> Option<Concept>;
}

/// In-memory concept store.
#[derive(Debug, Clone, Default)]
pub struct ConceptTable {
    by_code: HashMap<(String, String), Concept>,
}

impl ConceptTable {
    /// Loads an Athena `CONCEPT.csv` (tab separated) from disk.
    pub fn load(path: &Path) -> VocabResult<Self> {
        let file = std::fs::File::open(path).map_err(|source| VocabError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_reader(file, b'\t')?;
        tracing::info!("loaded {} concepts from {}", table.len(), path.display());
        Ok(table)
    }

    /// Reads concept rows from any delimited source with a header row.
    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> VocabResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .quoting(false)
            .flexible(true)
            .from_reader(reader);

        let mut table = Self::default();
        for (index, row) in csv_reader.deserialize::<Concept>().enumerate() {
            let concept = row?;
            if concept.vocabulary_id.is_empty() || concept.concept_code.is_empty() {
                return Err(VocabError::InvalidRow(format!(
                    "row {} lacks vocabulary_id or concept_code",
                    index + 1
                )));
            }
            table.insert(concept);
        }
        Ok(table)
    }

    /// Adds or replaces a concept, keyed by its vocabulary and code.
    pub fn insert(&mut self, concept: Concept) {
        self.by_code.insert(
            (concept.vocabulary_id.clone(), concept.concept_code.clone()),
            concept,
        );
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl ConceptLookup for ConceptTable {
    fn lookup(&self, vocabulary_id: &str, concept_code: &str) -> Option<Concept> {
        self.by_code
            .get(&(vocabulary_id.to_owned(), concept_code.to_owned()))
            .cloned()
    }
}
