//! Field resolution: one value from one element below a domain root.

use roxmltree::Node;

use crate::mapping::{AttributeRef, DataType, FieldLocator};

/// A FIELD or PK whose element is absent below the root.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not find field element {element} for {domain}/{field} root:{root_path}")]
pub struct ResolveError {
    pub domain: String,
    pub field: String,
    pub element: String,
    pub root_path: String,
}

/// Reads the value `locator` points at below `root`.
///
/// An element that exists but lacks the attribute (or text) yields `Ok(None)` with a
/// warning; only a missing element is an error. Casting applies to present values only.
pub fn resolve_field(
    locator: &FieldLocator,
    root: Node,
    domain: &str,
    field: &str,
    root_path: &str,
) -> Result<Option<String>, ResolveError> {
    tracing::info!("    FIELD {} for {domain}/{field}", locator.element);
    let Some(element) = locator.element.first(root) else {
        return Err(ResolveError {
            domain: domain.to_owned(),
            field: field.to_owned(),
            element: locator.element.to_string(),
            root_path: root_path.to_owned(),
        });
    };

    tracing::info!(
        "       ATTRIBUTE {} for {domain}/{field} {}",
        locator.attribute.as_str(),
        locator.element
    );
    let value = match &locator.attribute {
        AttributeRef::Text => element.text(),
        AttributeRef::Named { qualified, .. } => qualified.read(element),
    };

    match value {
        None => {
            tracing::warn!(
                "no value for field element {} for {domain}/{field} root:{root_path}",
                locator.element
            );
            return Ok(None);
        }
        Some("") => {
            tracing::warn!(
                "empty value for field element {} for {domain}/{field} root:{root_path}",
                locator.element
            );
        }
        Some(_) => {}
    }

    Ok(value.map(|raw| match locator.data_type {
        Some(DataType::Date) => cast_to_date(raw),
        Some(DataType::DateTime) => cast_to_datetime(raw),
        None => raw.to_owned(),
    }))
}

/// `"<root_path>/<element>/@<attribute>"`, the provenance of an extracted value.
pub fn provenance_path(root_path: &str, locator: &FieldLocator) -> String {
    format!(
        "{root_path}/{}/@{}",
        locator.element,
        locator.attribute.as_str()
    )
}

/// `YYYYMMDD` → `YYYY-MM-DD`.
///
/// Pure character slicing with no validation: short or malformed input produces
/// correspondingly short or malformed output.
pub fn cast_to_date(value: &str) -> String {
    format!(
        "{}-{}-{}",
        char_slice(value, 0, 4),
        char_slice(value, 4, 6),
        char_slice(value, 6, 8)
    )
}

/// `YYYYMMDDHHMM[...]` → `YYYY-MM-DD HH:MM`; eight characters or fewer fall back to
/// [`cast_to_date`]. Seconds and timezone offsets are dropped.
pub fn cast_to_datetime(value: &str) -> String {
    if value.chars().count() > 8 {
        format!(
            "{}-{}-{} {}:{}",
            char_slice(value, 0, 4),
            char_slice(value, 4, 6),
            char_slice(value, 6, 8),
            char_slice(value, 8, 10),
            char_slice(value, 10, 12)
        )
    } else {
        cast_to_date(value)
    }
}

/// Characters `start..end`, clamped to the string's length.
fn char_slice(value: &str, start: usize, end: usize) -> &str {
    let offset = |n: usize| value.char_indices().nth(n).map_or(value.len(), |(i, _)| i);
    let begin = offset(start);
    &value[begin..offset(end).max(begin)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpath::{Namespaces, PathExpr, QualifiedName};

    const OBSERVATION: &str = r#"<observation xmlns="urn:hl7-org:v3" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <id root="107c2dc0-67a5-11db-bd13-0800200c9a66"/>
  <code code="30313-1" codeSystem="2.16.840.1.113883.6.1" displayName="HGB"/>
  <text>Hemoglobin</text>
  <effectiveTime value="200003231430"/>
  <value xsi:type="PQ" value="13.2" unit="g/dL"/>
  <interpretationCode/>
</observation>"#;

    fn locator(element: &str, attribute: &str, data_type: Option<DataType>) -> FieldLocator {
        let ns = Namespaces::ccda();
        let attribute = if attribute == "#text" {
            AttributeRef::Text
        } else {
            AttributeRef::Named {
                name: attribute.to_owned(),
                qualified: QualifiedName::attribute(attribute, &ns).unwrap(),
            }
        };
        FieldLocator {
            element: PathExpr::compile(element, &ns).unwrap(),
            attribute,
            data_type,
        }
    }

    fn resolve(element: &str, attribute: &str, data_type: Option<DataType>) -> Result<Option<String>, ResolveError> {
        let doc = roxmltree::Document::parse(OBSERVATION).unwrap();
        resolve_field(
            &locator(element, attribute, data_type),
            doc.root_element(),
            "Measurement",
            "field",
            "./entry/observation",
        )
    }

    #[test]
    fn date_cast_inserts_dashes() {
        assert_eq!(cast_to_date("20230115"), "2023-01-15");
    }

    #[test]
    fn date_cast_does_not_validate() {
        assert_eq!(cast_to_date("2023"), "2023--");
        assert_eq!(cast_to_date("abcdefgh"), "abcd-ef-gh");
        assert_eq!(cast_to_date(""), "--");
    }

    #[test]
    fn datetime_cast_uses_hours_and_minutes() {
        assert_eq!(cast_to_datetime("202301151330"), "2023-01-15 13:30");
        assert_eq!(cast_to_datetime("20230115133000-0500"), "2023-01-15 13:30");
    }

    #[test]
    fn short_datetime_falls_back_to_date() {
        assert_eq!(cast_to_datetime("20230115"), "2023-01-15");
        assert_eq!(cast_to_datetime("202301"), "2023-01-");
    }

    #[test]
    fn reads_attribute_text_and_namespaced_attribute() {
        assert_eq!(resolve("code", "code", None), Ok(Some("30313-1".into())));
        assert_eq!(resolve("text", "#text", None), Ok(Some("Hemoglobin".into())));
        assert_eq!(resolve("value", "xsi:type", None), Ok(Some("PQ".into())));
    }

    #[test]
    fn applies_datetime_cast() {
        assert_eq!(
            resolve("effectiveTime", "value", Some(DataType::DateTime)),
            Ok(Some("2000-03-23 14:30".into()))
        );
        assert_eq!(
            resolve("effectiveTime", "value", Some(DataType::Date)),
            Ok(Some("2000-03-23".into()))
        );
    }

    #[test]
    fn present_element_without_attribute_is_null_not_error() {
        assert_eq!(resolve("interpretationCode", "code", None), Ok(None));
        assert_eq!(resolve("interpretationCode", "#text", Some(DataType::Date)), Ok(None));
    }

    #[test]
    fn missing_element_is_an_error() {
        let err = resolve("referenceRange", "value", None).unwrap_err();
        assert_eq!(err.element, "referenceRange");
        assert_eq!(err.root_path, "./entry/observation");
    }

    #[test]
    fn provenance_path_joins_root_element_and_attribute() {
        assert_eq!(
            provenance_path("./entry/observation", &locator("code", "codeSystem", None)),
            "./entry/observation/code/@codeSystem"
        );
        assert_eq!(
            provenance_path("./entry/observation", &locator("text", "#text", None)),
            "./entry/observation/text/@#text"
        );
    }
}
