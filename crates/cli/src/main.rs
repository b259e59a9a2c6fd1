use clap::Parser;
use roxmltree::{Document, Node};
use std::path::PathBuf;
use std::sync::Arc;

use ccda_core::xpath::{distinct_element_paths, Namespaces, PathExpr};
use omop_vocab::{ConceptTable, OidMap, Vocabulary};

#[derive(Parser)]
#[command(name = "code-snooper")]
#[command(about = "Finds all code elements in a CCDA document and shows what concepts they represent")]
struct Cli {
    /// CCDA file to inspect
    #[arg(short, long)]
    filename: PathBuf,
    /// OMOP CONCEPT.csv (tab separated) used to name the codes
    #[arg(long)]
    concepts: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let vocabulary = match &cli.concepts {
        Some(path) => Vocabulary::new(OidMap::builtin(), Arc::new(ConceptTable::load(path)?)),
        None => Vocabulary::without_concepts(),
    };

    let text = std::fs::read_to_string(&cli.filename)?;
    let doc = Document::parse(&text)?;
    for line in snoop(doc.root_element(), &vocabulary)? {
        println!("{line}");
    }
    Ok(())
}

/// One line per element whose path ends in a `code` element.
fn snoop(root: Node, vocabulary: &Vocabulary) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let namespaces = Namespaces::ccda();
    let mut lines = Vec::new();
    for path in distinct_element_paths(root, &namespaces) {
        if !path.ends_with("/code") {
            continue;
        }
        let expr = PathExpr::compile(&path, &namespaces)?;
        for element in expr.select(root) {
            lines.push(describe_code(&path, element, vocabulary));
        }
    }
    Ok(lines)
}

fn describe_code(path: &str, element: Node, vocabulary: &Vocabulary) -> String {
    let oid = element.attribute("codeSystem");
    let code = element.attribute("code");
    let vocabulary_id = oid.and_then(|oid| vocabulary.vocabulary_for_oid(oid));

    match (vocabulary_id, code) {
        (Some(vocabulary_id), Some(code)) => match vocabulary.lookup(vocabulary_id, code) {
            Some(concept) => format!(
                "{path}  vocab:{vocabulary_id} code:{code} \"{}\" domain:{} class:{}",
                concept.concept_name, concept.domain_id, concept.concept_class_id
            ),
            None => format!(
                "{path}  vocab:{vocabulary_id} code:{code} (code not available in OMOP vocabulary here)"
            ),
        },
        _ => format!(
            "{path}  -- no attributes, or not both -- oid:{}  code:{}",
            oid.unwrap_or("None"),
            code.unwrap_or("None")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omop_vocab::Concept;

    const DOC: &str = r#"<ClinicalDocument xmlns="urn:hl7-org:v3">
  <code code="34133-9" codeSystem="2.16.840.1.113883.6.1"/>
  <component>
    <section>
      <code code="30954-2" codeSystem="2.16.840.1.113883.6.1"/>
      <entry><observation><code code="4548-4" codeSystem="2.16.840.1.113883.6.1"/></observation></entry>
      <entry><observation><code nullFlavor="UNK"/></observation></entry>
      <entry><observation><statusCode code="completed"/></observation></entry>
    </section>
  </component>
</ClinicalDocument>"#;

    fn vocabulary() -> Vocabulary {
        let mut concepts = ConceptTable::default();
        concepts.insert(Concept::new(
            3004410,
            "Hemoglobin A1c/Hemoglobin.total in Blood",
            "Measurement",
            "LOINC",
            "Lab Test",
            "4548-4",
        ));
        Vocabulary::new(OidMap::builtin(), Arc::new(concepts))
    }

    #[test]
    fn reports_every_code_element() {
        let doc = Document::parse(DOC).unwrap();
        let lines = snoop(doc.root_element(), &vocabulary()).unwrap();

        assert_eq!(
            lines,
            vec![
                "./code  vocab:LOINC code:34133-9 (code not available in OMOP vocabulary here)",
                "./component/section/code  vocab:LOINC code:30954-2 (code not available in OMOP vocabulary here)",
                "./component/section/entry/observation/code  vocab:LOINC code:4548-4 \"Hemoglobin A1c/Hemoglobin.total in Blood\" domain:Measurement class:Lab Test",
                "./component/section/entry/observation/code  -- no attributes, or not both -- oid:None  code:None",
            ]
        );
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
