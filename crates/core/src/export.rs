//! Rendering extraction results: console report, per-domain CSV files and JSON.

use indexmap::IndexSet;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::driver::DocumentExtraction;
use crate::error::{ExportError, ExportResult};
use crate::keys::KeyRegistry;
use crate::record::OutputRecord;

/// Writes the plain-text dump of every domain's records.
///
/// The registry comes first, then one block per record listing each field's value and
/// provenance, closed by the record's field count. Failed domains are logged, not printed.
pub fn write_report<W: Write>(out: &mut W, extraction: &DocumentExtraction) -> std::io::Result<()> {
    writeln!(out, "PK_dict: {}", extraction.keys)?;
    for (domain, outcome) in &extraction.domains {
        let domain_extraction = match outcome {
            Ok(domain_extraction) => domain_extraction,
            Err(err) => {
                tracing::warn!("no data for domain {domain}: {err}");
                continue;
            }
        };
        for record in &domain_extraction.records {
            writeln!(out, "\n\nDOMAIN: {domain}")?;
            for (field, resolved) in record.iter() {
                writeln!(out, "    FIELD:{field}")?;
                match &resolved.value {
                    Some(value) => writeln!(out, "        VALUE:{value}")?,
                    None => writeln!(out, "        VALUE:None")?,
                }
                writeln!(out, "        PATH:{}", resolved.provenance)?;
            }
            writeln!(out, "\n\nDOMAIN: {domain} {}\n\n", record.len())?;
        }
    }
    Ok(())
}

/// Writes one `<file_stem>_<domain>.csv` per domain with records; returns the paths written.
///
/// The header is the union of field names across the domain's records, in first-seen order.
/// Cells hold values only; null values are empty cells.
pub fn write_csv(output_dir: &Path, extraction: &DocumentExtraction) -> ExportResult<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir).map_err(|source| ExportError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let stem = Path::new(&extraction.source)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| extraction.source.clone());

    let mut written = Vec::new();
    for (domain, outcome) in &extraction.domains {
        let Ok(domain_extraction) = outcome else {
            continue;
        };
        if domain_extraction.records.is_empty() {
            continue;
        }

        let path = output_dir.join(format!("{stem}_{domain}.csv"));
        write_domain_csv(&path, &domain_extraction.records)?;
        tracing::info!(
            "wrote {} {domain} rows to {}",
            domain_extraction.records.len(),
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}

fn write_domain_csv(path: &Path, records: &[OutputRecord]) -> ExportResult<()> {
    let header: IndexSet<&str> = records.iter().flat_map(OutputRecord::field_names).collect();

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&header)?;
    for record in records {
        writer.write_record(header.iter().map(|field| {
            record
                .value(field)
                .map(ToString::to_string)
                .unwrap_or_default()
        }))?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[derive(Serialize)]
struct DocumentJson<'a> {
    source: &'a str,
    keys: &'a KeyRegistry,
    domains: indexmap::IndexMap<&'a str, DomainJson<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum DomainJson<'a> {
    Records(&'a [OutputRecord]),
    Failed { error: String },
}

/// Writes the extraction as one pretty-printed JSON object.
pub fn write_json<W: Write>(out: &mut W, extraction: &DocumentExtraction) -> ExportResult<()> {
    let domains = extraction
        .domains
        .iter()
        .map(|(domain, outcome)| {
            let rendered = match outcome {
                Ok(domain_extraction) => DomainJson::Records(&domain_extraction.records),
                Err(err) => DomainJson::Failed {
                    error: err.to_string(),
                },
            };
            (domain.as_str(), rendered)
        })
        .collect();

    let document = DocumentJson {
        source: &extraction.source,
        keys: &extraction.keys,
        domains,
    };
    serde_json::to_writer_pretty(&mut *out, &document)?;
    writeln!(out).map_err(|source| ExportError::Io {
        path: PathBuf::from("<output>"),
        source,
    })?;
    Ok(())
}
