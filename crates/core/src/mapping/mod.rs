//! The mapping table: per OMOP domain, how each output field is produced.
//!
//! A [`MappingTable`] is an ordered list of [`DomainTable`]s; each domain table is an
//! ordered map of field name → [`FieldSpec`]. Field kinds are a closed set
//! ([`FieldKind`]) and every kind carries exactly the attributes it needs, so a table that
//! has been constructed cannot be missing a key at resolution time.
//!
//! Tables are written in YAML (see [`wire`]) and validated when loaded. Built-in tables
//! for Person, Visit and Measurement ship with the crate ([`MappingTable::builtin`]).

mod wire;

use indexmap::IndexMap;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::transform::{Transformer, TransformerRegistry};
use crate::xpath::{PathExpr, QualifiedName};

/// Built-in domain tables, in processing order.
const BUILTIN_TABLES: &[(&str, &str)] = &[
    ("person.yaml", include_str!("tables/person.yaml")),
    ("visit.yaml", include_str!("tables/visit.yaml")),
    ("measurement.yaml", include_str!("tables/measurement.yaml")),
];

/// Casting applied to an extracted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum DataType {
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "DATETIME")]
    DateTime,
}

/// Which part of the located element holds the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeRef {
    /// The element's text content (`#text`).
    Text,
    /// A named attribute. `name` is kept as written for provenance paths.
    Named { name: String, qualified: QualifiedName },
}

impl AttributeRef {
    pub fn as_str(&self) -> &str {
        match self {
            AttributeRef::Text => crate::constants::TEXT_ATTRIBUTE,
            AttributeRef::Named { name, .. } => name,
        }
    }
}

/// Location of a value below the domain's root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLocator {
    pub element: PathExpr,
    pub attribute: AttributeRef,
    pub data_type: Option<DataType>,
}

/// A transformer call: parameter name → name of an already produced field.
#[derive(Debug, Clone)]
pub struct Derivation {
    pub transformer: Transformer,
    pub argument_names: IndexMap<String, String>,
}

/// The closed set of field kinds.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// The repeating element each record is built from.
    Root { element: PathExpr },
    Field(FieldLocator),
    PrimaryKey(FieldLocator),
    /// Reads the registry entry `key`, written by an earlier PK or priority group.
    /// `element` and `attribute` are only reported when the key is missing.
    ForeignKey {
        key: String,
        element: Option<String>,
        attribute: Option<String>,
    },
    Derived(Derivation),
    /// Like `Derived`; the result decides whether the record belongs to this domain.
    Domain(Derivation),
    Hash { fields: Vec<String> },
}

impl FieldKind {
    /// The configuration tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            FieldKind::Root { .. } => "ROOT",
            FieldKind::Field(_) => "FIELD",
            FieldKind::PrimaryKey(_) => "PK",
            FieldKind::ForeignKey { .. } => "FK",
            FieldKind::Derived(_) => "DERIVED",
            FieldKind::Domain(_) => "DOMAIN",
            FieldKind::Hash { .. } => "HASH",
        }
    }
}

/// Marks a field as one candidate for the logical field `group`; lower rank wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Priority {
    pub group: String,
    pub rank: i64,
}

/// One entry of a domain table.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub kind: FieldKind,
    /// Whether the field survives record cleaning.
    pub output: bool,
    pub priority: Option<Priority>,
}

/// What a HASH field digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    /// Digest of the configured field *names*. Every record sharing a spec gets the same
    /// hash; kept as the default because existing outputs depend on it.
    #[default]
    FieldNames,
    /// Digest of the record's values for the configured fields.
    FieldValues,
}

/// The fields of one OMOP domain.
#[derive(Debug, Clone)]
pub struct DomainTable {
    name: String,
    fields: IndexMap<String, FieldSpec>,
}

impl DomainTable {
    pub fn new(name: impl Into<String>) -> ConfigResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName(name));
        }
        Ok(Self {
            name,
            fields: IndexMap::new(),
        })
    }

    /// Appends a field. A second DOMAIN field is rejected.
    pub fn insert(&mut self, field: impl Into<String>, spec: FieldSpec) -> ConfigResult<()> {
        let field = field.into();
        if field.trim().is_empty() {
            return Err(ConfigError::EmptyName(format!("{}/{field}", self.name)));
        }
        if matches!(spec.kind, FieldKind::Domain(_)) {
            if let Some(first) = self.domain_field().map(|(name, _)| name.to_owned()) {
                return Err(ConfigError::MultipleDomainFields {
                    domain: self.name.clone(),
                    first,
                    second: field,
                });
            }
        }
        self.fields.insert(field, spec);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The first ROOT path, if the table declares one.
    pub fn root(&self) -> Option<&PathExpr> {
        self.fields.values().find_map(|spec| match &spec.kind {
            FieldKind::Root { element } => Some(element),
            _ => None,
        })
    }

    /// The DOMAIN field, if any.
    pub fn domain_field(&self) -> Option<(&str, &Derivation)> {
        self.fields.iter().find_map(|(name, spec)| match &spec.kind {
            FieldKind::Domain(derivation) => Some((name.as_str(), derivation)),
            _ => None,
        })
    }

    /// Priority groups: group name → candidate fields sorted by ascending rank.
    ///
    /// Sorting is stable, so equal ranks keep declaration order.
    pub fn priority_groups(&self) -> IndexMap<&str, Vec<(&str, i64)>> {
        let mut groups: IndexMap<&str, Vec<(&str, i64)>> = IndexMap::new();
        for (name, spec) in &self.fields {
            if let Some(priority) = &spec.priority {
                groups
                    .entry(priority.group.as_str())
                    .or_default()
                    .push((name.as_str(), priority.rank));
            }
        }
        for candidates in groups.values_mut() {
            candidates.sort_by_key(|(_, rank)| *rank);
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// All domain tables of a run, in processing order.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    domains: IndexMap<String, DomainTable>,
    hash_mode: HashMode,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Person, Visit and Measurement tables.
    pub fn builtin(registry: &TransformerRegistry) -> ConfigResult<Self> {
        let mut table = Self::new();
        for (source, text) in BUILTIN_TABLES {
            tracing::debug!("loading built-in mapping {source}");
            for domain in wire::parse_domains(text, registry)? {
                table.push(domain);
            }
        }
        Ok(table)
    }

    /// Parses a mapping table from YAML.
    pub fn from_yaml(text: &str, registry: &TransformerRegistry) -> ConfigResult<Self> {
        let mut table = Self::new();
        for domain in wire::parse_domains(text, registry)? {
            table.push(domain);
        }
        Ok(table)
    }

    /// Reads and parses a YAML mapping file.
    pub fn load(path: &Path, registry: &TransformerRegistry) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text, registry)
    }

    /// Appends a domain, replacing any domain of the same name in place.
    pub fn push(&mut self, domain: DomainTable) {
        self.domains.insert(domain.name.clone(), domain);
    }

    pub fn with_hash_mode(mut self, hash_mode: HashMode) -> Self {
        self.hash_mode = hash_mode;
        self
    }

    pub fn hash_mode(&self) -> HashMode {
        self.hash_mode
    }

    pub fn get(&self, domain: &str) -> Option<&DomainTable> {
        self.domains.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &DomainTable> {
        self.domains.values()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
