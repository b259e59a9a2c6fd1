//! Output records and value provenance.

use indexmap::IndexMap;
use omop_types::Value;
use std::fmt;

/// Where a resolved value came from.
///
/// Extracted values carry the XML path they were read from. Computed values carry a tag
/// naming the field kind that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Path(String),
    ForeignKey,
    Derived,
    Domain,
    Hash,
    RootPath,
}

impl Provenance {
    pub fn as_str(&self) -> &str {
        match self {
            Provenance::Path(path) => path,
            Provenance::ForeignKey => "FK",
            Provenance::Derived => "DERIVED",
            Provenance::Domain => "DOMAIN",
            Provenance::Hash => "HASH",
            Provenance::RootPath => "root_path",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Provenance {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A value paired with its provenance.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Resolved {
    pub value: Option<Value>,
    pub provenance: Provenance,
}

impl Resolved {
    pub fn new(value: Option<Value>, provenance: Provenance) -> Self {
        Self { value, provenance }
    }
}

/// One OMOP row under construction, keyed by field name in insertion order.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct OutputRecord {
    fields: IndexMap<String, Resolved>,
}

impl OutputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a field, replacing any earlier value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, resolved: Resolved) {
        self.fields.insert(name.into(), resolved);
    }

    pub fn get(&self, name: &str) -> Option<&Resolved> {
        self.fields.get(name)
    }

    /// The value of a field; `None` if the field is absent or null.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(|r| r.value.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resolved)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl IntoIterator for OutputRecord {
    type Item = (String, Resolved);
    type IntoIter = indexmap::map::IntoIter<String, Resolved>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, Resolved)> for OutputRecord {
    fn from_iter<I: IntoIterator<Item = (String, Resolved)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
