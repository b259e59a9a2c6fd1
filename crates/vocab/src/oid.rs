//! Code-system OID → OMOP vocabulary id.

use omop_types::NonEmptyText;
use std::collections::HashMap;

/// Code systems commonly seen in CCDA documents, keyed by OID.
const BUILTIN_OIDS: &[(&str, &str)] = &[
    ("2.16.840.1.113883.6.1", "LOINC"),
    ("2.16.840.1.113883.6.96", "SNOMED"),
    ("2.16.840.1.113883.6.88", "RxNorm"),
    ("2.16.840.1.113883.6.69", "NDC"),
    ("2.16.840.1.113883.6.12", "CPT4"),
    ("2.16.840.1.113883.6.285", "HCPCS"),
    ("2.16.840.1.113883.6.90", "ICD10CM"),
    ("2.16.840.1.113883.6.4", "ICD10PCS"),
    ("2.16.840.1.113883.6.103", "ICD9CM"),
    ("2.16.840.1.113883.6.104", "ICD9Proc"),
    ("2.16.840.1.113883.12.292", "CVX"),
    ("2.16.840.1.113883.6.8", "UCUM"),
    ("2.16.840.1.113883.5.1", "Gender"),
    ("2.16.840.1.113883.6.238", "Race"),
];

/// Lookup from code-system OID to OMOP vocabulary id.
#[derive(Debug, Clone, Default)]
pub struct OidMap {
    entries: HashMap<String, NonEmptyText>,
}

impl OidMap {
    /// Map pre-populated with the well-known HL7 code systems.
    pub fn builtin() -> Self {
        let mut map = Self::default();
        for (oid, vocabulary_id) in BUILTIN_OIDS {
            if let Ok(vocabulary_id) = NonEmptyText::new(vocabulary_id) {
                map.entries.insert((*oid).to_owned(), vocabulary_id);
            }
        }
        map
    }

    /// Adds or replaces the vocabulary for `oid`.
    pub fn insert(&mut self, oid: impl Into<String>, vocabulary_id: NonEmptyText) {
        self.entries.insert(oid.into(), vocabulary_id);
    }

    pub fn vocabulary_id(&self, oid: &str) -> Option<&str> {
        self.entries.get(oid.trim()).map(NonEmptyText::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
