//! Document driver: runs every domain table over one CCDA document.

use indexmap::IndexMap;
use roxmltree::{Document, Node};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{DomainError, ExtractError, ExtractResult};
use crate::keys::KeyRegistry;
use crate::mapping::{DomainTable, MappingTable};
use crate::process::{belongs_to_domain, clean_record, process_root};
use crate::record::OutputRecord;

/// Records produced for one domain of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainExtraction {
    pub domain: String,
    /// Cleaned records, one per retained root, in document order.
    pub records: Vec<OutputRecord>,
    /// Fields that failed on at least one root.
    pub error_fields: BTreeSet<String>,
    pub roots_matched: usize,
    /// Roots whose DOMAIN field named another domain.
    pub routed_out: usize,
}

/// Per-domain outcome for one document, in mapping-table order.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentExtraction {
    pub source: String,
    pub domains: IndexMap<String, Result<DomainExtraction, DomainError>>,
    /// Registry contents after the last domain ran.
    pub keys: KeyRegistry,
}

impl DocumentExtraction {
    /// Records of `domain`, or an empty slice if the domain failed or is unknown.
    pub fn records(&self, domain: &str) -> &[OutputRecord] {
        match self.domains.get(domain) {
            Some(Ok(extraction)) => &extraction.records,
            _ => &[],
        }
    }

    pub fn record_count(&self) -> usize {
        self.domains
            .values()
            .filter_map(|outcome| outcome.as_ref().ok())
            .map(|extraction| extraction.records.len())
            .sum()
    }
}

/// Applies a [`MappingTable`] to documents.
#[derive(Debug, Clone)]
pub struct Extractor {
    mapping: MappingTable,
}

impl Extractor {
    pub fn new(mapping: MappingTable) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    /// Reads and extracts one file with a fresh key registry.
    pub fn parse_document(&self, path: &Path) -> ExtractResult<DocumentExtraction> {
        let mut keys = KeyRegistry::new();
        self.parse_document_with_keys(path, &mut keys)
    }

    /// Reads and extracts one file, reading and writing keys in `keys`.
    pub fn parse_document_with_keys(
        &self,
        path: &Path,
        keys: &mut KeyRegistry,
    ) -> ExtractResult<DocumentExtraction> {
        let text = std::fs::read_to_string(path).map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.parse_text(&source_name, &text, keys)
            .map_err(|err| match err {
                ExtractError::Xml { source, .. } => ExtractError::Xml {
                    path: path.to_path_buf(),
                    source,
                },
                other => other,
            })
    }

    /// Extracts a document already in memory. `source_name` labels logs and the result.
    pub fn parse_text(
        &self,
        source_name: &str,
        text: &str,
        keys: &mut KeyRegistry,
    ) -> ExtractResult<DocumentExtraction> {
        let _span = tracing::info_span!("document", file = source_name).entered();
        tracing::info!("parsing {source_name}");

        let doc = Document::parse(text).map_err(|source| {
            tracing::error!("failed to parse {source_name}: {source}");
            ExtractError::Xml {
                path: PathBuf::from(source_name),
                source,
            }
        })?;

        let mut domains = IndexMap::new();
        for table in self.mapping.domains() {
            let outcome = self.parse_domain(doc.root_element(), table, source_name, keys);
            domains.insert(table.name().to_owned(), outcome);
        }

        Ok(DocumentExtraction {
            source: source_name.to_owned(),
            domains,
            keys: keys.clone(),
        })
    }

    /// Builds every record of `table` below `document_root`.
    pub fn parse_domain(
        &self,
        document_root: Node,
        table: &DomainTable,
        source_name: &str,
        keys: &mut KeyRegistry,
    ) -> Result<DomainExtraction, DomainError> {
        let domain = table.name();
        let _span = tracing::info_span!("domain", domain).entered();
        tracing::info!("DOMAIN domain:{domain} file:{source_name}");

        let Some(root_path) = table.root() else {
            tracing::error!("DOMAIN {domain} lacks a ROOT element");
            return Err(DomainError::MissingRoot {
                domain: domain.to_owned(),
            });
        };

        let roots = root_path.select(document_root);
        tracing::info!("NUM ROOTS {domain} {}", roots.len());
        if roots.is_empty() {
            tracing::error!("couldn't find root element for {domain} with {root_path}");
            return Err(DomainError::NoRootElements {
                domain: domain.to_owned(),
                path: root_path.to_string(),
            });
        }

        let mut extraction = DomainExtraction {
            domain: domain.to_owned(),
            records: Vec::with_capacity(roots.len()),
            error_fields: BTreeSet::new(),
            roots_matched: roots.len(),
            routed_out: 0,
        };

        for root in roots {
            let processed = process_root(
                root,
                root_path.as_str(),
                table,
                self.mapping.hash_mode(),
                keys,
                &mut extraction.error_fields,
            );

            if !belongs_to_domain(processed.domain_id.as_ref(), domain) {
                if let Some(domain_id) = &processed.domain_id {
                    tracing::info!("DOMAIN routed record to {domain_id}, dropping from {domain}");
                }
                extraction.routed_out += 1;
                continue;
            }

            let record = clean_record(processed.record, &processed.priority_groups, table);
            extraction.records.push(record);
        }

        if !extraction.error_fields.is_empty() {
            tracing::error!(
                "DOMAIN Fields with errors in domain {domain}: {:?}",
                extraction.error_fields
            );
        }

        Ok(extraction)
    }
}
