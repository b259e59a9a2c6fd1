//! YAML wire format for mapping tables and its translation into [`DomainTable`]s.
//!
//! ```yaml
//! Measurement:
//!   root:
//!     config_type: ROOT
//!     element: "./component/structuredBody/component/section/entry/organizer/component/observation"
//!   measurement_id_basic:
//!     config_type: FIELD
//!     output: false
//!     element: id
//!     attribute: root
//!     priority: [measurement_id, 1]
//!   measurement_concept_id:
//!     config_type: DERIVED
//!     output: true
//!     FUNCTION: map_hl7_to_omop_concept_id
//!     argument_names:
//!       concept_code: measurement_concept_code
//!       vocabulary_oid: measurement_concept_codeSystem
//! ```
//!
//! Unknown keys are rejected. Keys a kind does not use are ignored; keys a kind requires
//! must be present.

use indexmap::IndexMap;
use serde::Deserialize;

use super::{
    AttributeRef, DataType, Derivation, DomainTable, FieldKind, FieldLocator, FieldSpec, Priority,
};
use crate::constants::TEXT_ATTRIBUTE;
use crate::error::{ConfigError, ConfigResult};
use crate::transform::TransformerRegistry;
use crate::xpath::{Namespaces, PathExpr, QualifiedName};

type MappingWire = IndexMap<String, IndexMap<String, FieldSpecWire>>;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ConfigType {
    Root,
    Field,
    Pk,
    Fk,
    Derived,
    Domain,
    Hash,
}

impl ConfigType {
    fn tag(self) -> &'static str {
        match self {
            ConfigType::Root => "ROOT",
            ConfigType::Field => "FIELD",
            ConfigType::Pk => "PK",
            ConfigType::Fk => "FK",
            ConfigType::Derived => "DERIVED",
            ConfigType::Domain => "DOMAIN",
            ConfigType::Hash => "HASH",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldSpecWire {
    config_type: ConfigType,
    #[serde(default)]
    output: bool,
    #[serde(default)]
    priority: Option<(String, i64)>,
    #[serde(default)]
    element: Option<String>,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    data_type: Option<DataType>,
    #[serde(default, rename = "FK")]
    fk: Option<String>,
    #[serde(default, rename = "FUNCTION")]
    function: Option<String>,
    #[serde(default)]
    argument_names: Option<IndexMap<String, String>>,
    #[serde(default)]
    fields: Option<Vec<String>>,
}

/// Parses YAML text into domain tables, in document order.
pub(super) fn parse_domains(
    text: &str,
    registry: &TransformerRegistry,
) -> ConfigResult<Vec<DomainTable>> {
    let deserializer = serde_yaml::Deserializer::from_str(text);
    let wire: MappingWire = match serde_path_to_error::deserialize(deserializer) {
        Ok(parsed) => parsed,
        Err(err) => {
            let path = err.path().to_string();
            let message = err.into_inner().to_string();
            let path = if path.is_empty() || path == "." {
                "<root>".to_owned()
            } else {
                path
            };
            return Err(ConfigError::Schema { path, message });
        }
    };

    let translator = Translator {
        registry,
        namespaces: Namespaces::ccda(),
    };
    wire.into_iter()
        .map(|(domain, fields)| translator.domain(domain, fields))
        .collect()
}

struct Translator<'r> {
    registry: &'r TransformerRegistry,
    namespaces: Namespaces,
}

impl Translator<'_> {
    fn domain(&self, name: String, fields: IndexMap<String, FieldSpecWire>) -> ConfigResult<DomainTable> {
        let mut table = DomainTable::new(name)?;
        for (field, wire) in fields {
            let spec = self.field(table.name(), &field, wire)?;
            table.insert(field, spec)?;
        }
        Ok(table)
    }

    fn field(&self, domain: &str, field: &str, wire: FieldSpecWire) -> ConfigResult<FieldSpec> {
        let kind_tag = wire.config_type.tag();
        let missing = |key: &'static str| ConfigError::MissingKey {
            domain: domain.to_owned(),
            field: field.to_owned(),
            kind: kind_tag,
            key,
        };

        let kind = match wire.config_type {
            ConfigType::Root => {
                let element = wire.element.as_deref().ok_or_else(|| missing("element"))?;
                FieldKind::Root {
                    element: self.path(domain, field, element)?,
                }
            }
            ConfigType::Field | ConfigType::Pk => {
                let element = wire.element.as_deref().ok_or_else(|| missing("element"))?;
                let attribute = wire.attribute.as_deref().ok_or_else(|| missing("attribute"))?;
                let locator = FieldLocator {
                    element: self.path(domain, field, element)?,
                    attribute: self.attribute(domain, field, attribute)?,
                    data_type: wire.data_type,
                };
                if matches!(wire.config_type, ConfigType::Pk) {
                    FieldKind::PrimaryKey(locator)
                } else {
                    FieldKind::Field(locator)
                }
            }
            ConfigType::Fk => FieldKind::ForeignKey {
                key: wire.fk.unwrap_or_else(|| field.to_owned()),
                element: wire.element,
                attribute: wire.attribute,
            },
            ConfigType::Derived | ConfigType::Domain => {
                let name = wire.function.as_deref().ok_or_else(|| missing("FUNCTION"))?;
                let argument_names = wire.argument_names.ok_or_else(|| missing("argument_names"))?;
                let transformer =
                    self.registry
                        .resolve(name)
                        .ok_or_else(|| ConfigError::UnknownTransformer {
                            domain: domain.to_owned(),
                            field: field.to_owned(),
                            name: name.to_owned(),
                        })?;
                let derivation = Derivation {
                    transformer,
                    argument_names,
                };
                if matches!(wire.config_type, ConfigType::Domain) {
                    FieldKind::Domain(derivation)
                } else {
                    FieldKind::Derived(derivation)
                }
            }
            ConfigType::Hash => FieldKind::Hash {
                fields: wire.fields.ok_or_else(|| missing("fields"))?,
            },
        };

        Ok(FieldSpec {
            kind,
            output: wire.output,
            priority: wire.priority.map(|(group, rank)| Priority { group, rank }),
        })
    }

    fn path(&self, domain: &str, field: &str, element: &str) -> ConfigResult<PathExpr> {
        PathExpr::compile(element, &self.namespaces).map_err(|source| ConfigError::InvalidPath {
            domain: domain.to_owned(),
            field: field.to_owned(),
            source,
        })
    }

    fn attribute(&self, domain: &str, field: &str, attribute: &str) -> ConfigResult<AttributeRef> {
        if attribute == TEXT_ATTRIBUTE {
            return Ok(AttributeRef::Text);
        }
        let qualified = QualifiedName::attribute(attribute, &self.namespaces).map_err(|reason| {
            ConfigError::InvalidAttribute {
                domain: domain.to_owned(),
                field: field.to_owned(),
                attribute: attribute.to_owned(),
                reason,
            }
        })?;
        Ok(AttributeRef::Named {
            name: attribute.to_owned(),
            qualified,
        })
    }
}
