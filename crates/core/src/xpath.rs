//! Namespace-aware path expressions over a parsed CCDA tree.
//!
//! Mapping tables address elements with ElementTree-style paths, for example:
//!
//! ```text
//! ./component/structuredBody/component/section/templateId[@root='2.16.840.1.113883.10.20.22.2.3.1']/../entry
//! ```
//!
//! Supported syntax:
//! - steps: `tag`, `prefix:tag`, `{uri}tag`, `*`, `.`, `..`
//! - `//` selects descendants (not including the context node) matching the next step
//! - predicates: `[@attr]`, `[@attr='v']`, `[tag]`, `[tag='text']`, `[n]` (1-based, among same-tag siblings)
//!
//! Unprefixed element names resolve to the document's default namespace (`urn:hl7-org:v3`);
//! unprefixed attribute names have no namespace, as in XML itself.
//!
//! Paths are compiled once ([`PathExpr::compile`]) and evaluated against any context node.
//! Results are de-duplicated and keep traversal order.

use roxmltree::{Node, NodeId};
use std::collections::{HashMap, HashSet};

use crate::constants::{HL7_NAMESPACE, SDTC_NAMESPACE, XSI_NAMESPACE};

/// Errors produced when compiling a path expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path '{path}': {reason}")]
pub struct PathSyntaxError {
    pub path: String,
    pub reason: String,
}

/// Prefix → namespace URI bindings used while compiling paths.
#[derive(Debug, Clone)]
pub struct Namespaces {
    default: String,
    prefixes: HashMap<String, String>,
}

impl Namespaces {
    /// The CCDA bindings: default and `hl7` → HL7 v3, plus `xsi` and `sdtc`.
    pub fn ccda() -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("hl7".to_owned(), HL7_NAMESPACE.to_owned());
        prefixes.insert("xsi".to_owned(), XSI_NAMESPACE.to_owned());
        prefixes.insert("sdtc".to_owned(), SDTC_NAMESPACE.to_owned());
        Self {
            default: HL7_NAMESPACE.to_owned(),
            prefixes,
        }
    }

    pub fn uri(&self, prefix: &str) -> Option<&str> {
        self.prefixes.get(prefix).map(String::as_str)
    }

    fn prefix_for(&self, uri: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| prefix.as_str() != "hl7")
            .find(|(_, bound)| bound.as_str() == uri)
            .map(|(prefix, _)| prefix.as_str())
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::ccda()
    }
}

/// A qualified name with its namespace already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub local: String,
}

impl QualifiedName {
    /// Resolves an attribute name; unprefixed attributes carry no namespace.
    pub fn attribute(name: &str, namespaces: &Namespaces) -> Result<Self, String> {
        resolve_name(name, namespaces, None)
    }

    /// Reads this attribute from `node`.
    pub fn read<'a>(&self, node: Node<'a, '_>) -> Option<&'a str> {
        match &self.namespace {
            Some(ns) => node.attribute((ns.as_str(), self.local.as_str())),
            None => node.attribute(self.local.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameTest {
    Any,
    Name(QualifiedName),
}

impl NameTest {
    fn matches(&self, node: Node) -> bool {
        if !node.is_element() {
            return false;
        }
        match self {
            NameTest::Any => true,
            NameTest::Name(name) => {
                node.tag_name().name() == name.local
                    && node.tag_name().namespace() == name.namespace.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    HasAttribute(QualifiedName),
    AttributeEquals(QualifiedName, String),
    HasChild(NameTest),
    ChildTextEquals(NameTest, String),
    Position(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    SelfNode,
    Parent,
    Child(NameTest, Vec<Predicate>),
    Descendant(NameTest, Vec<Predicate>),
}

/// A compiled path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    source: String,
    steps: Vec<Step>,
}

impl PathExpr {
    /// Compiles `path` using the given namespace bindings.
    pub fn compile(path: &str, namespaces: &Namespaces) -> Result<Self, PathSyntaxError> {
        let fail = |reason: &str| PathSyntaxError {
            path: path.to_owned(),
            reason: reason.to_owned(),
        };

        if path.trim().is_empty() {
            return Err(fail("path is empty"));
        }
        if path.starts_with('/') {
            return Err(fail("absolute paths are not supported, start with './'"));
        }

        let segments = split_segments(path).map_err(|reason| fail(&reason))?;
        let mut steps = Vec::with_capacity(segments.len());
        let mut descend = false;

        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                if index == segments.len() - 1 {
                    return Err(fail("path ends with '/'"));
                }
                if descend {
                    return Err(fail("'///' is not a valid step"));
                }
                descend = true;
                continue;
            }

            let step = match segment.as_str() {
                "." if !descend => Step::SelfNode,
                ".." if !descend => Step::Parent,
                "." | ".." => return Err(fail("'//' must be followed by an element step")),
                _ => {
                    let (test, predicates) =
                        parse_element_step(segment, namespaces).map_err(|reason| fail(&reason))?;
                    if descend {
                        Step::Descendant(test, predicates)
                    } else {
                        Step::Child(test, predicates)
                    }
                }
            };
            descend = false;
            steps.push(step);
        }

        Ok(Self {
            source: path.to_owned(),
            steps,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// All nodes matched from `context`.
    pub fn select<'a, 'input>(&self, context: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
        let mut current = vec![context];
        for step in &self.steps {
            let mut seen: HashSet<NodeId> = HashSet::new();
            let mut next = Vec::new();
            for node in &current {
                for found in apply_step(step, *node) {
                    if seen.insert(found.id()) {
                        next.push(found);
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// The first node matched from `context`.
    pub fn first<'a, 'input>(&self, context: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
        self.select(context).into_iter().next()
    }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn apply_step<'a, 'input>(step: &Step, node: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    match step {
        Step::SelfNode => vec![node],
        Step::Parent => node.parent_element().into_iter().collect(),
        Step::Child(test, predicates) => {
            let candidates = node.children().filter(|c| test.matches(*c)).collect();
            filter_predicates(candidates, predicates)
        }
        Step::Descendant(test, predicates) => {
            let candidates = node
                .descendants()
                .skip(1)
                .filter(|d| test.matches(*d))
                .collect();
            filter_predicates(candidates, predicates)
        }
    }
}

fn filter_predicates<'a, 'input>(
    mut candidates: Vec<Node<'a, 'input>>,
    predicates: &[Predicate],
) -> Vec<Node<'a, 'input>> {
    for predicate in predicates {
        candidates = match predicate {
            Predicate::Position(position) => candidates
                .into_iter()
                .filter(|n| is_nth_of_tag(*n, *position))
                .collect(),
            Predicate::HasAttribute(name) => candidates
                .into_iter()
                .filter(|n| name.read(*n).is_some())
                .collect(),
            Predicate::AttributeEquals(name, value) => candidates
                .into_iter()
                .filter(|n| name.read(*n) == Some(value.as_str()))
                .collect(),
            Predicate::HasChild(test) => candidates
                .into_iter()
                .filter(|n| n.children().any(|c| test.matches(c)))
                .collect(),
            Predicate::ChildTextEquals(test, value) => candidates
                .into_iter()
                .filter(|n| {
                    n.children()
                        .filter(|c| test.matches(*c))
                        .any(|c| text_content(c) == *value)
                })
                .collect(),
        };
    }
    candidates
}

/// True if `node` is the `position`-th child of its parent with the same tag.
fn is_nth_of_tag(node: Node, position: usize) -> bool {
    let Some(parent) = node.parent() else {
        return position == 1;
    };
    parent
        .children()
        .filter(|c| c.is_element() && c.tag_name() == node.tag_name())
        .nth(position - 1)
        == Some(node)
}

/// All text below `node`, concatenated in document order.
fn text_content(node: Node) -> String {
    node.descendants()
        .filter(|d| d.is_text())
        .filter_map(|d| d.text())
        .collect()
}

/// Splits on '/' outside of `[...]`, `{...}` and quotes. `a//b` yields `["a", "", "b"]`.
fn split_segments(path: &str) -> Result<Vec<String>, String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;
    let mut in_braces = false;
    let mut quote: Option<char> = None;

    for ch in path.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' if bracket_depth > 0 => {
                quote = Some(ch);
                current.push(ch);
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth == 0 {
                    return Err("unbalanced ']'".into());
                }
                bracket_depth -= 1;
                current.push(ch);
            }
            '{' => {
                in_braces = true;
                current.push(ch);
            }
            '}' => {
                in_braces = false;
                current.push(ch);
            }
            '/' if bracket_depth == 0 && !in_braces => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }

    if quote.is_some() {
        return Err("unterminated quote".into());
    }
    if bracket_depth != 0 {
        return Err("unbalanced '['".into());
    }
    if in_braces {
        return Err("unterminated '{'".into());
    }
    segments.push(current);
    Ok(segments)
}

fn parse_element_step(
    segment: &str,
    namespaces: &Namespaces,
) -> Result<(NameTest, Vec<Predicate>), String> {
    let name_end = segment.find('[').unwrap_or(segment.len());
    let test = parse_name_test(&segment[..name_end], namespaces)?;

    let mut predicates = Vec::new();
    let mut rest = &segment[name_end..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(format!("unexpected text '{rest}' after predicate"));
        }
        let close = find_predicate_end(rest).ok_or("unbalanced '['")?;
        predicates.push(parse_predicate(&rest[1..close], namespaces)?);
        rest = &rest[close + 1..];
    }
    Ok((test, predicates))
}

fn find_predicate_end(text: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (index, ch) in text.char_indices().skip(1) {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, ']') => return Some(index),
            _ => {}
        }
    }
    None
}

fn parse_name_test(text: &str, namespaces: &Namespaces) -> Result<NameTest, String> {
    let text = text.trim();
    if text == "*" {
        return Ok(NameTest::Any);
    }
    resolve_name(text, namespaces, Some(namespaces.default.as_str())).map(NameTest::Name)
}

fn resolve_name(
    text: &str,
    namespaces: &Namespaces,
    default: Option<&str>,
) -> Result<QualifiedName, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty name".into());
    }

    if let Some(rest) = text.strip_prefix('{') {
        let (uri, local) = rest.split_once('}').ok_or("unterminated '{'")?;
        return valid_local(local).map(|local| QualifiedName {
            namespace: (!uri.is_empty()).then(|| uri.to_owned()),
            local,
        });
    }

    match text.split_once(':') {
        Some((prefix, local)) => {
            let uri = namespaces
                .uri(prefix)
                .ok_or_else(|| format!("unknown namespace prefix '{prefix}'"))?;
            valid_local(local).map(|local| QualifiedName {
                namespace: Some(uri.to_owned()),
                local,
            })
        }
        None => valid_local(text).map(|local| QualifiedName {
            namespace: default.map(str::to_owned),
            local,
        }),
    }
}

fn valid_local(local: &str) -> Result<String, String> {
    let ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(local.to_owned())
    } else {
        Err(format!("invalid name '{local}'"))
    }
}

fn parse_predicate(body: &str, namespaces: &Namespaces) -> Result<Predicate, String> {
    let body = body.trim();
    if body.is_empty() {
        return Err("empty predicate".into());
    }

    if body.chars().all(|c| c.is_ascii_digit()) {
        let position: usize = body.parse().map_err(|_| "invalid position")?;
        if position == 0 {
            return Err("positions start at 1".into());
        }
        return Ok(Predicate::Position(position));
    }

    let (lhs, rhs) = match body.split_once('=') {
        Some((lhs, rhs)) => (lhs.trim(), Some(unquote(rhs.trim())?)),
        None => (body, None),
    };

    if let Some(attribute) = lhs.strip_prefix('@') {
        let name = resolve_name(attribute, namespaces, None)?;
        return Ok(match rhs {
            Some(value) => Predicate::AttributeEquals(name, value),
            None => Predicate::HasAttribute(name),
        });
    }

    let test = parse_name_test(lhs, namespaces)?;
    Ok(match rhs {
        Some(value) => Predicate::ChildTextEquals(test, value),
        None => Predicate::HasChild(test),
    })
}

fn unquote(text: &str) -> Result<String, String> {
    let mut chars = text.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open), Some(close)) if open == close && (open == '\'' || open == '"') => {
            Ok(chars.as_str().to_owned())
        }
        _ => Err(format!("predicate value {text} must be quoted")),
    }
}

/// Distinct element paths under `root`, in document order, without positions.
///
/// Paths are relative to `root` (`./a/b`) and can be compiled back with [`PathExpr::compile`].
/// Elements in the default namespace are written unprefixed; other bound namespaces use
/// their prefix and unbound ones the `{uri}` form.
pub fn distinct_element_paths(root: Node, namespaces: &Namespaces) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();

    for node in root.descendants().skip(1).filter(Node::is_element) {
        let mut parts = Vec::new();
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if current.id() == root.id() {
                break;
            }
            parts.push(step_name(current, namespaces));
            cursor = current.parent_element();
        }
        parts.push(".".to_owned());
        parts.reverse();
        let path = parts.join("/");
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    }
    paths
}

fn step_name(node: Node, namespaces: &Namespaces) -> String {
    let local = node.tag_name().name();
    match node.tag_name().namespace() {
        Some(ns) if ns == namespaces.default => local.to_owned(),
        Some(ns) => match namespaces.prefix_for(ns) {
            Some(prefix) => format!("{prefix}:{local}"),
            None => format!("{{{ns}}}{local}"),
        },
        None => format!("{{}}{local}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<ClinicalDocument xmlns="urn:hl7-org:v3" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:sdtc="urn:hl7-org:sdtc">
  <component>
    <structuredBody>
      <component>
        <section>
          <templateId root="2.16.840.1.113883.10.20.22.2.3.1"/>
          <templateId root="2.16.840.1.113883.10.20.22.2.3.1" extension="2015-08-01"/>
          <entry><organizer><component><observation><id root="a"/></observation></component></organizer></entry>
          <entry><organizer><component><observation><id root="b"/></observation></component></organizer></entry>
        </section>
      </component>
      <component>
        <section>
          <templateId root="2.16.840.1.113883.10.20.22.2.6.1"/>
          <entry><act><code code="CONC"/></act></entry>
        </section>
      </component>
    </structuredBody>
  </component>
  <recordTarget><patientRole><patient><sdtc:raceCode code="2106-3"/><name>Eve</name></patient></patientRole></recordTarget>
  <value xsi:type="PQ" value="7.2"/>
</ClinicalDocument>"#;

    fn compile(path: &str) -> PathExpr {
        PathExpr::compile(path, &Namespaces::ccda()).unwrap()
    }

    #[test]
    fn parent_step_after_template_predicate_is_deduplicated() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let path = compile(
            "./component/structuredBody/component/section/templateId[@root='2.16.840.1.113883.10.20.22.2.3.1']/../entry/organizer/component/observation",
        );
        let found = path.select(doc.root_element());
        assert_eq!(found.len(), 2);
        let ids: Vec<_> = found
            .iter()
            .map(|n| compile("id").first(*n).unwrap().attribute("root").unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn descendant_step_finds_nested_codes() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let found = compile(".//code").select(doc.root_element());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attribute("code"), Some("CONC"));
    }

    #[test]
    fn prefixed_elements_and_attributes_resolve() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let race = compile("./recordTarget/patientRole/patient/sdtc:raceCode")
            .first(doc.root_element())
            .unwrap();
        assert_eq!(race.attribute("code"), Some("2106-3"));

        let value = compile("value").first(doc.root_element()).unwrap();
        let xsi_type = QualifiedName::attribute("xsi:type", &Namespaces::ccda()).unwrap();
        assert_eq!(xsi_type.read(value), Some("PQ"));
        let bare_type = QualifiedName::attribute("type", &Namespaces::ccda()).unwrap();
        assert_eq!(bare_type.read(value), None);
    }

    #[test]
    fn position_and_child_predicates() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let root = doc.root_element();
        let second = compile("./component/structuredBody/component[2]/section/templateId")
            .first(root)
            .unwrap();
        assert_eq!(second.attribute("root"), Some("2.16.840.1.113883.10.20.22.2.6.1"));

        let with_name = compile("./recordTarget/patientRole/patient[name='Eve']").select(root);
        assert_eq!(with_name.len(), 1);
        let without = compile("./recordTarget/patientRole/patient[name='Bob']").select(root);
        assert!(without.is_empty());
    }

    #[test]
    fn descendant_position_counts_per_parent() {
        let doc = roxmltree::Document::parse(
            r#"<section xmlns="urn:hl7-org:v3">
  <entry><observation id="a1"/><observation id="a2"/></entry>
  <entry><act/><observation id="b1"/></entry>
</section>"#,
        )
        .unwrap();
        let ids: Vec<_> = compile(".//observation[1]")
            .select(doc.root_element())
            .iter()
            .map(|n| n.attribute("id").unwrap())
            .collect();
        assert_eq!(ids, vec!["a1", "b1"]);

        let second: Vec<_> = compile("./entry/observation[2]")
            .select(doc.root_element())
            .iter()
            .map(|n| n.attribute("id").unwrap())
            .collect();
        assert_eq!(second, vec!["a2"]);
    }

    #[test]
    fn child_text_predicate_joins_mixed_content() {
        let doc = roxmltree::Document::parse(
            r#"<patientRole xmlns="urn:hl7-org:v3">
  <patient><name>Eve <family>Smith</family></name></patient>
  <patient><name>Eve</name></patient>
</patientRole>"#,
        )
        .unwrap();
        let found = compile("./patient[name='Eve Smith']").select(doc.root_element());
        assert_eq!(found.len(), 1);
        let plain = compile("./patient[name='Eve']").select(doc.root_element());
        assert_eq!(plain.len(), 1);
        assert_ne!(found[0], plain[0]);
    }

    #[test]
    fn unmatched_path_selects_nothing() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        assert!(compile("./documentationOf/serviceEvent").select(doc.root_element()).is_empty());
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let ns = Namespaces::ccda();
        assert!(PathExpr::compile("", &ns).is_err());
        assert!(PathExpr::compile("/ClinicalDocument", &ns).is_err());
        assert!(PathExpr::compile("section/", &ns).is_err());
        assert!(PathExpr::compile("templateId[@root='x'", &ns).is_err());
        assert!(PathExpr::compile("foo:bar", &ns).is_err());
        assert!(PathExpr::compile("entry[0]", &ns).is_err());
        assert!(PathExpr::compile("templateId[@root=x]", &ns).is_err());
    }

    #[test]
    fn distinct_paths_round_trip_through_compile() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let ns = Namespaces::ccda();
        let paths = distinct_element_paths(doc.root_element(), &ns);
        assert!(paths.contains(&"./component/structuredBody/component/section/entry/act/code".to_owned()));
        assert!(paths.contains(&"./recordTarget/patientRole/patient/sdtc:raceCode".to_owned()));
        // both sections share one path
        assert_eq!(
            paths
                .iter()
                .filter(|p| p.as_str() == "./component/structuredBody/component/section")
                .count(),
            1
        );
        for path in &paths {
            let expr = PathExpr::compile(path, &ns).unwrap();
            assert!(!expr.select(doc.root_element()).is_empty(), "{path}");
        }
    }
}
