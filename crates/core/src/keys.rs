//! Primary-key registry shared between domains of a run.
//!
//! A PRIMARY KEY field writes its value here under its field name; a FOREIGN KEY field in a
//! later domain reads it back. Priority groups also publish their winning value here.
//!
//! The registry is an explicit value owned by the caller. [`crate::Extractor::parse_document`]
//! creates a fresh one per document; pass the same registry to
//! [`crate::Extractor::parse_document_with_keys`] to carry keys across documents.

use omop_types::Value;
use std::collections::BTreeMap;

/// Most recent value written for each key name.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct KeyRegistry {
    values: BTreeMap<String, Option<Value>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `name`, overwriting any earlier value.
    ///
    /// A null value is recorded too; a later FK lookup then finds the key but no value.
    pub fn set(&mut self, name: impl Into<String>, value: Option<Value>) {
        self.values.insert(name.into(), value);
    }

    /// `None` if the key was never written; `Some(None)` if it was written as null.
    pub fn get(&self, name: &str) -> Option<&Option<Value>> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (index, (name, value)) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(value) => write!(f, "{name}: {value}")?,
                None => write!(f, "{name}: None")?,
            }
        }
        f.write_str("}")
    }
}
