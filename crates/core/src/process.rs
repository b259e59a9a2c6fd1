//! Building one record from one root element.
//!
//! The passes run in a fixed order, each over the whole domain table in declaration order:
//!
//! 1. basic fields: FIELD, PK, FK
//! 2. DERIVED
//! 3. DOMAIN
//! 4. HASH
//! 5. priority groups
//!
//! A later pass may read anything an earlier pass produced. Within a pass, a field can only
//! see fields declared before it.

use omop_types::Value;
use roxmltree::Node;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::constants::{HASH_SEPARATOR, ROOT_PATH_FIELD};
use crate::keys::KeyRegistry;
use crate::mapping::{Derivation, DomainTable, FieldKind, HashMode};
use crate::record::{OutputRecord, Provenance, Resolved};
use crate::resolve::{provenance_path, resolve_field};
use crate::transform::Arguments;

/// The uncleaned result for one root element.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRoot {
    pub record: OutputRecord,
    /// Result of the DOMAIN field, if the table has one and it succeeded.
    pub domain_id: Option<Value>,
    /// Every priority group declared by the table, resolved or not.
    pub priority_groups: Vec<String>,
}

/// Mutable state shared by the passes for one root.
struct Pass<'a, 'k> {
    table: &'a DomainTable,
    root_path: &'a str,
    keys: &'k mut KeyRegistry,
    errors: &'k mut BTreeSet<String>,
    record: OutputRecord,
}

/// Runs every pass for `root` and appends the `root_path` bookkeeping field.
///
/// Failed fields are added to `errors`; primary keys and priority winners are written to
/// `keys`.
pub fn process_root(
    root: Node,
    root_path: &str,
    table: &DomainTable,
    hash_mode: HashMode,
    keys: &mut KeyRegistry,
    errors: &mut BTreeSet<String>,
) -> ProcessedRoot {
    tracing::info!(
        "  ROOT for domain:{}, we have tag:{}",
        table.name(),
        root.tag_name().name()
    );

    let mut pass = Pass {
        table,
        root_path,
        keys,
        errors,
        record: OutputRecord::new(),
    };
    pass.basic_fields(root);
    pass.derived_fields();
    let domain_id = pass.domain_fields();
    pass.hash_fields(hash_mode);
    let priority_groups = pass.priority_fields();

    let mut record = pass.record;
    record.insert(
        ROOT_PATH_FIELD,
        Resolved::new(Some(Value::from(root_path)), Provenance::RootPath),
    );

    ProcessedRoot {
        record,
        domain_id,
        priority_groups,
    }
}

impl Pass<'_, '_> {
    fn basic_fields(&mut self, root: Node) {
        let table = self.table;
        let domain = table.name();
        for (field, spec) in table.fields() {
            match &spec.kind {
                FieldKind::Field(locator) | FieldKind::PrimaryKey(locator) => {
                    tracing::info!("     {} for {domain}/{field}", spec.kind.tag());
                    let value =
                        match resolve_field(locator, root, domain, field, self.root_path) {
                            Ok(value) => value.map(Value::Text),
                            Err(err) => {
                                tracing::error!("FIELD {err}");
                                self.errors.insert(field.to_owned());
                                None
                            }
                        };
                    if matches!(spec.kind, FieldKind::PrimaryKey(_)) {
                        self.keys.set(field, value.clone());
                    }
                    self.record.insert(
                        field,
                        Resolved::new(
                            value,
                            Provenance::Path(provenance_path(self.root_path, locator)),
                        ),
                    );
                }
                FieldKind::ForeignKey {
                    key,
                    element,
                    attribute,
                } => {
                    tracing::info!("     FK for {domain}/{field}");
                    match self.keys.get(key) {
                        Some(value) => {
                            self.record
                                .insert(field, Resolved::new(value.clone(), Provenance::ForeignKey));
                        }
                        None => {
                            tracing::error!(
                                "FK could not find {key} in the key registry for {domain}/{field}"
                            );
                            self.errors.insert(field.to_owned());
                            self.record.insert(
                                field,
                                Resolved::new(
                                    None,
                                    Provenance::Path(foreign_key_miss_path(
                                        self.root_path,
                                        element.as_deref(),
                                        attribute.as_deref(),
                                    )),
                                ),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn derived_fields(&mut self) {
        let table = self.table;
        for (field, spec) in table.fields() {
            if let FieldKind::Derived(derivation) = &spec.kind {
                tracing::info!("     DERIVING {field}");
                let value = self.derive(field, derivation, "DERIVED");
                self.record
                    .insert(field, Resolved::new(value, Provenance::Derived));
            }
        }
    }

    /// Returns the routing domain id computed by the DOMAIN field, if any.
    fn domain_fields(&mut self) -> Option<Value> {
        let table = self.table;
        let (field, derivation) = table.domain_field()?;
        tracing::info!("     Deriving DOMAIN {field}");
        let value = self.derive(field, derivation, "DOMAIN");
        self.record
            .insert(field, Resolved::new(value.clone(), Provenance::Domain));
        if let Some(domain_id) = &value {
            tracing::info!("     DOMAIN captured as {domain_id} for {field}");
        }
        value
    }

    /// Gathers arguments and calls the transformer. Failures are logged and give `None`.
    fn derive(&mut self, field: &str, derivation: &Derivation, tag: &str) -> Option<Value> {
        let domain = self.table.name();
        let mut args = Arguments::new();
        for (arg_name, input_field) in &derivation.argument_names {
            tracing::info!("     -- {field}, arg_name:{arg_name} field_name:{input_field}");
            match self.record.get(input_field) {
                Some(resolved) => args.set(arg_name, resolved.value.clone()),
                None => {
                    tracing::error!(
                        "{tag} domain:{domain} field:{field} could not find {input_field} in the record"
                    );
                    self.errors.insert(field.to_owned());
                }
            }
        }

        match derivation.transformer.call(&args) {
            Ok(value) => {
                tracing::info!(
                    "     {tag} {} for {field} via {}",
                    value.as_ref().map_or_else(|| "None".to_owned(), |v| v.to_string()),
                    derivation.transformer.name()
                );
                value
            }
            Err(err) => {
                tracing::error!(
                    "{tag} {field}: transformer {} failed: {err}. args:{args}. \
                     Check that argument_names match the transformer's parameters.",
                    derivation.transformer.name()
                );
                self.errors.insert(field.to_owned());
                None
            }
        }
    }

    fn hash_fields(&mut self, hash_mode: HashMode) {
        let table = self.table;
        for (field, spec) in table.fields() {
            if let FieldKind::Hash { fields } = &spec.kind {
                let input = match hash_mode {
                    HashMode::FieldNames => fields.join(HASH_SEPARATOR),
                    HashMode::FieldValues => fields
                        .iter()
                        .map(|name| {
                            self.record
                                .value(name)
                                .map(|v| v.to_string())
                                .unwrap_or_default()
                        })
                        .collect::<Vec<_>>()
                        .join(HASH_SEPARATOR),
                };
                let digest = hex::encode(Sha256::digest(input.as_bytes()));
                tracing::info!("     HASH {digest} for {field}");
                self.record
                    .insert(field, Resolved::new(Some(Value::Text(digest)), Provenance::Hash));
            }
        }
    }

    /// Copies the first non-null candidate of each group to the group name.
    fn priority_fields(&mut self) -> Vec<String> {
        let table = self.table;
        let groups = table.priority_groups();
        for (group, candidates) in &groups {
            let winner = candidates.iter().find_map(|(candidate, _)| {
                self.record
                    .get(candidate)
                    .filter(|resolved| resolved.value.is_some())
                    .cloned()
            });
            match winner {
                Some(resolved) => {
                    self.keys.set(*group, resolved.value.clone());
                    self.record.insert(*group, resolved);
                }
                None => tracing::warn!(
                    "no candidate with a value for priority group {group} in {}",
                    table.name()
                ),
            }
        }
        groups.keys().map(|group| (*group).to_owned()).collect()
    }
}

/// Provenance for an FK with no registry entry: the declared element and attribute,
/// with `no element/` and `no attribute/` standing in for absent ones.
fn foreign_key_miss_path(root_path: &str, element: Option<&str>, attribute: Option<&str>) -> String {
    let mut path = format!("{root_path}/");
    match element {
        Some(element) => {
            path.push_str(element);
            path.push_str("/@");
        }
        None => path.push_str("no element/"),
    }
    match attribute {
        Some(attribute) => path.push_str(attribute),
        None => path.push_str("no attribute/"),
    }
    path
}

/// Keeps priority groups, `output: true` fields and `root_path`; drops everything else.
pub fn clean_record(
    record: OutputRecord,
    priority_groups: &[String],
    table: &DomainTable,
) -> OutputRecord {
    record
        .into_iter()
        .filter(|(name, _)| {
            if priority_groups.iter().any(|group| group == name) {
                return true;
            }
            if let Some(spec) = table.get(name) {
                return spec.output;
            }
            if name == ROOT_PATH_FIELD {
                return true;
            }
            tracing::error!(
                "found key {name} that's neither a priority group nor in the {} table",
                table.name()
            );
            false
        })
        .collect()
}

/// A record belongs to `domain` unless its DOMAIN field computed a different domain.
pub fn belongs_to_domain(domain_id: Option<&Value>, domain: &str) -> bool {
    match domain_id {
        None => true,
        Some(Value::Text(id)) => id == domain,
        Some(other) => other.to_string() == domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingTable;
    use crate::transform::{TransformError, TransformerRegistry};
    use crate::xpath::{Namespaces, PathExpr};

    const OBSERVATION: &str = r#"<observation xmlns="urn:hl7-org:v3" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <id extension="obs-1"/>
  <code code="4548-4" codeSystem="2.16.840.1.113883.6.1"/>
  <effectiveTime value="20230115"/>
  <value xsi:type="PQ" value="7.2" unit="%"/>
</observation>"#;

    const ROOT_PATH: &str = "./entry/observation";

    fn registry() -> TransformerRegistry {
        let mut registry = TransformerRegistry::new();
        registry.register("echo", |args: &Arguments| Ok(args.get("input").cloned()));
        registry.register("fixed_domain", |args: &Arguments| {
            Ok(args.get("domain").cloned())
        });
        registry.register("always_fails", |_: &Arguments| {
            Err(TransformError::Failed("lookup service unavailable".into()))
        });
        registry
    }

    fn table(yaml: &str) -> DomainTable {
        let mapping = MappingTable::from_yaml(yaml, &registry()).unwrap();
        let table = mapping.domains().next().unwrap().clone();
        table
    }

    fn run(table: &DomainTable, hash_mode: HashMode, keys: &mut KeyRegistry) -> (ProcessedRoot, BTreeSet<String>) {
        let doc = roxmltree::Document::parse(OBSERVATION).unwrap();
        let mut errors = BTreeSet::new();
        let processed = process_root(doc.root_element(), ROOT_PATH, table, hash_mode, keys, &mut errors);
        (processed, errors)
    }

    #[test]
    fn basic_fields_record_value_and_path() {
        let table = table(
            r#"
Measurement:
  code: {config_type: FIELD, element: code, attribute: code, output: true}
  time: {config_type: FIELD, element: effectiveTime, attribute: value, data_type: DATE, output: true}
"#,
        );
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert!(errors.is_empty());
        assert_eq!(
            processed.record.get("code"),
            Some(&Resolved::new(
                Some(Value::from("4548-4")),
                Provenance::Path("./entry/observation/code/@code".into())
            ))
        );
        assert_eq!(processed.record.value("time"), Some(&Value::from("2023-01-15")));
        assert_eq!(
            processed.record.get(ROOT_PATH_FIELD),
            Some(&Resolved::new(Some(Value::from(ROOT_PATH)), Provenance::RootPath))
        );
    }

    #[test]
    fn missing_element_is_null_and_reported() {
        let table = table("Measurement:\n  range: {config_type: FIELD, element: referenceRange, attribute: value}\n");
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert!(processed.record.contains("range"));
        assert_eq!(processed.record.value("range"), None);
        assert!(errors.contains("range"));
    }

    #[test]
    fn primary_key_is_published_and_foreign_key_reads_it() {
        let mut keys = KeyRegistry::new();
        keys.set("person_id", Some(Value::from("P1")));

        let table = table(
            r#"
Measurement:
  person_id: {config_type: FK, FK: person_id, output: true}
  observation_id: {config_type: PK, element: id, attribute: extension, output: true}
"#,
        );
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut keys);
        assert!(errors.is_empty());
        assert_eq!(
            processed.record.get("person_id"),
            Some(&Resolved::new(Some(Value::from("P1")), Provenance::ForeignKey))
        );
        assert_eq!(keys.get("observation_id"), Some(&Some(Value::from("obs-1"))));
    }

    #[test]
    fn unresolved_foreign_key_is_null_with_placeholder_path() {
        let table = table("Measurement:\n  visit_occurrence_id: {config_type: FK, output: true}\n");
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(
            processed.record.get("visit_occurrence_id"),
            Some(&Resolved::new(
                None,
                Provenance::Path("./entry/observation/no element/no attribute/".into())
            ))
        );
        assert!(errors.contains("visit_occurrence_id"));
    }

    #[test]
    fn unresolved_foreign_key_reports_declared_location() {
        let table = table(
            "Measurement:\n  visit_occurrence_id: {config_type: FK, element: encounter/id, attribute: root}\n",
        );
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(
            processed.record.get("visit_occurrence_id").unwrap().provenance,
            Provenance::Path("./entry/observation/encounter/id/@root".into())
        );
        assert!(errors.contains("visit_occurrence_id"));
    }

    #[test]
    fn derived_values_render_in_logs_and_hashes() {
        let table = table(
            r#"
Measurement:
  raw: {config_type: FIELD, element: value, attribute: value}
  copy: {config_type: DERIVED, FUNCTION: echo, argument_names: {input: raw}}
  digest: {config_type: HASH, fields: [copy]}
"#,
        );
        let (processed, errors) = run(&table, HashMode::FieldValues, &mut KeyRegistry::new());
        assert!(errors.is_empty());
        let expected = hex::encode(Sha256::digest(b"7.2"));
        assert_eq!(processed.record.value("digest"), Some(&Value::Text(expected)));
    }

    #[test]
    fn derived_reads_earlier_fields_and_tolerates_missing_inputs() {
        let table = table(
            r#"
Measurement:
  raw: {config_type: FIELD, element: value, attribute: value}
  copy: {config_type: DERIVED, FUNCTION: echo, argument_names: {input: raw}}
  orphan: {config_type: DERIVED, FUNCTION: echo, argument_names: {input: not_a_field}}
"#,
        );
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(
            processed.record.get("copy"),
            Some(&Resolved::new(Some(Value::from("7.2")), Provenance::Derived))
        );
        assert_eq!(processed.record.get("orphan"), Some(&Resolved::new(None, Provenance::Derived)));
        assert_eq!(errors.iter().collect::<Vec<_>>(), vec!["orphan"]);
    }

    #[test]
    fn failing_transformer_gives_null_with_kind_tag() {
        let table = table(
            r#"
Measurement:
  raw: {config_type: FIELD, element: value, attribute: value}
  broken: {config_type: DERIVED, FUNCTION: always_fails, argument_names: {input: raw}}
  routed: {config_type: DOMAIN, FUNCTION: always_fails, argument_names: {input: raw}}
"#,
        );
        let (processed, errors) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(processed.record.get("broken"), Some(&Resolved::new(None, Provenance::Derived)));
        assert_eq!(processed.record.get("routed"), Some(&Resolved::new(None, Provenance::Domain)));
        assert_eq!(processed.domain_id, None);
        assert!(errors.contains("broken") && errors.contains("routed"));
    }

    #[test]
    fn domain_field_result_is_returned_for_routing() {
        let table = table(
            r#"
Measurement:
  label: {config_type: FIELD, element: value, attribute: "xsi:type"}
  routed: {config_type: DOMAIN, FUNCTION: fixed_domain, argument_names: {domain: label}}
"#,
        );
        let (processed, _) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(processed.domain_id, Some(Value::from("PQ")));
        assert_eq!(processed.record.get("routed").unwrap().provenance, Provenance::Domain);
    }

    #[test]
    fn hash_of_names_ignores_record_values() {
        let table = table(
            r#"
Measurement:
  code: {config_type: FIELD, element: code, attribute: code}
  digest: {config_type: HASH, fields: [person_id, code]}
"#,
        );
        let (processed, _) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        let expected = hex::encode(Sha256::digest(b"person_id-code"));
        assert_eq!(
            processed.record.get("digest"),
            Some(&Resolved::new(Some(Value::Text(expected)), Provenance::Hash))
        );
    }

    #[test]
    fn hash_of_values_uses_empty_string_for_missing() {
        let table = table(
            r#"
Measurement:
  code: {config_type: FIELD, element: code, attribute: code}
  digest: {config_type: HASH, fields: [person_id, code]}
"#,
        );
        let (processed, _) = run(&table, HashMode::FieldValues, &mut KeyRegistry::new());
        let expected = hex::encode(Sha256::digest(b"-4548-4"));
        assert_eq!(processed.record.value("digest"), Some(&Value::Text(expected)));
    }

    #[test]
    fn priority_skips_null_candidates() {
        let table = table(
            r#"
Measurement:
  measurement_id_basic: {config_type: FIELD, element: id, attribute: root, priority: [measurement_id, 1]}
  measurement_id_hash: {config_type: HASH, fields: [a], priority: [measurement_id, 100]}
"#,
        );
        let mut keys = KeyRegistry::new();
        let (processed, _) = run(&table, HashMode::FieldNames, &mut keys);

        let hash = processed.record.get("measurement_id_hash").unwrap().clone();
        assert_eq!(processed.record.get("measurement_id"), Some(&hash));
        assert_eq!(keys.get("measurement_id"), Some(&hash.value));
        assert_eq!(processed.priority_groups, vec!["measurement_id".to_owned()]);
    }

    #[test]
    fn priority_group_without_values_produces_no_entry() {
        let table = table(
            r#"
Measurement:
  a: {config_type: FIELD, element: id, attribute: root, priority: [best, 1]}
  b: {config_type: FIELD, element: code, attribute: displayName, priority: [best, 2]}
"#,
        );
        let mut keys = KeyRegistry::new();
        let (processed, _) = run(&table, HashMode::FieldNames, &mut keys);
        assert!(!processed.record.contains("best"));
        assert!(!keys.contains("best"));
        assert_eq!(processed.priority_groups, vec!["best".to_owned()]);
    }

    #[test]
    fn clean_keeps_output_fields_priority_groups_and_root_path() {
        let table = table(
            r#"
Measurement:
  code: {config_type: FIELD, element: code, attribute: code, output: false}
  unit: {config_type: FIELD, element: value, attribute: unit, output: true}
  id_basic: {config_type: FIELD, element: id, attribute: extension, priority: [measurement_id, 1]}
"#,
        );
        let (processed, _) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        let cleaned = clean_record(processed.record, &processed.priority_groups, &table);
        let names: Vec<_> = cleaned.field_names().collect();
        assert_eq!(names, vec!["unit", "measurement_id", ROOT_PATH_FIELD]);
    }

    #[test]
    fn clean_drops_unknown_keys() {
        let table = table("Measurement:\n  unit: {config_type: FIELD, element: value, attribute: unit, output: true}\n");
        let mut record = OutputRecord::new();
        record.insert("stray", Resolved::new(None, Provenance::Derived));
        record.insert("unit", Resolved::new(Some(Value::from("%")), Provenance::Derived));
        let cleaned = clean_record(record, &[], &table);
        assert_eq!(cleaned.field_names().collect::<Vec<_>>(), vec!["unit"]);
    }

    #[test]
    fn routing_keeps_matching_or_missing_domain() {
        assert!(belongs_to_domain(None, "Measurement"));
        assert!(belongs_to_domain(Some(&Value::from("Measurement")), "Measurement"));
        assert!(!belongs_to_domain(Some(&Value::from("Condition")), "Measurement"));
    }

    #[test]
    fn root_path_uses_configured_string() {
        let ns = Namespaces::ccda();
        let root = PathExpr::compile(ROOT_PATH, &ns).unwrap();
        let table = table("Measurement:\n  unit: {config_type: FIELD, element: value, attribute: unit}\n");
        let (processed, _) = run(&table, HashMode::FieldNames, &mut KeyRegistry::new());
        assert_eq!(
            processed.record.value(ROOT_PATH_FIELD),
            Some(&Value::from(root.as_str()))
        );
    }
}
