mod logging;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use std::path::{Path, PathBuf};

use ccda_core::config::{
    hash_mode_from_env_value, log_level_from_env_value, path_from_env_value,
};
use ccda_core::constants::DOCUMENT_EXTENSION;
use ccda_core::{export, Extractor, ExtractorConfig};

#[derive(Parser)]
#[command(name = "ccda-omop")]
#[command(about = "Extract OMOP rows from CCDA documents")]
#[command(group(ArgGroup::new("input").required(true).args(["filename", "directory"])))]
struct Cli {
    /// Single CCDA file to parse
    #[arg(short, long)]
    filename: Option<PathBuf>,
    /// Directory whose *.xml files are parsed, in name order
    #[arg(short, long)]
    directory: Option<PathBuf>,
    /// Write <file>_<domain>.csv files here
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Directory for per-file and per-domain logs (default: logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Minimum level written to the log files (default: warn)
    #[arg(long)]
    log_level: Option<String>,
    /// YAML mapping table to use instead of the built-in tables
    #[arg(long)]
    mapping: Option<PathBuf>,
    /// OMOP CONCEPT.csv (tab separated) used for concept lookups
    #[arg(long)]
    concepts: Option<PathBuf>,
    /// Hash record values instead of field names in HASH fields
    #[arg(long)]
    hash_values: bool,
    /// Print records as JSON instead of the text report
    #[arg(long)]
    json: bool,
}

/// Main entry point for the CCDA to OMOP extractor
///
/// Settings come from the command line first, then the environment (a `.env` file is
/// honoured), then defaults.
///
/// # Environment Variables
/// - `CCDA_LOG_DIR`: log directory (default: "logs")
/// - `CCDA_LOG_LEVEL`: minimum level written to log files (default: "warn")
/// - `CCDA_OUTPUT_DIR`: CSV output directory (default: no CSV output)
/// - `CCDA_MAPPING_FILE`: YAML mapping table (default: built-in tables)
/// - `CCDA_CONCEPT_FILE`: OMOP CONCEPT.csv (default: no concepts)
/// - `CCDA_HASH_MODE`: `names` or `values` (default: "names")
fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = resolve_config(&cli)?;
    logging::init(config.log_dir(), config.log_file_level())?;
    let extractor = config
        .build_extractor()
        .context("failed to build the extractor")?;

    let files = match (&cli.filename, &cli.directory) {
        (Some(file), _) => vec![file.clone()],
        (None, Some(dir)) => document_files(dir)?,
        (None, None) => anyhow::bail!("either --filename or --directory is required"),
    };

    tracing::info!("++ Processing {} file(s)", files.len());
    let mut failed = 0usize;
    for path in &files {
        if let Err(err) = process_file(&extractor, &config, path, cli.json) {
            tracing::error!("FILE {}: {err:#}", path.display());
            failed += 1;
        }
    }
    if failed > 0 {
        tracing::warn!("{failed} of {} file(s) could not be processed", files.len());
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ExtractorConfig> {
    let env = |name: &str| std::env::var(name).ok();

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| path_from_env_value(env("CCDA_LOG_DIR")))
        .unwrap_or_else(|| ExtractorConfig::default().log_dir().to_path_buf());
    let log_file_level = log_level_from_env_value(cli.log_level.clone().or_else(|| env("CCDA_LOG_LEVEL")))?;
    let hash_mode = if cli.hash_values {
        ccda_core::HashMode::FieldValues
    } else {
        hash_mode_from_env_value(env("CCDA_HASH_MODE"))?
    };

    let config = ExtractorConfig::new(
        log_dir,
        cli.output_dir
            .clone()
            .or_else(|| path_from_env_value(env("CCDA_OUTPUT_DIR"))),
        hash_mode,
        log_file_level,
        cli.mapping
            .clone()
            .or_else(|| path_from_env_value(env("CCDA_MAPPING_FILE"))),
        cli.concepts
            .clone()
            .or_else(|| path_from_env_value(env("CCDA_CONCEPT_FILE"))),
    )?;
    Ok(config)
}

/// Regular `*.xml` files directly inside `dir`, sorted by name.
fn document_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_document = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(DOCUMENT_EXTENSION));
        if path.is_file() && is_document {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn process_file(
    extractor: &Extractor,
    config: &ExtractorConfig,
    path: &Path,
    json: bool,
) -> anyhow::Result<()> {
    println!("PROCESSING {} ", path.display());
    tracing::info!("PROCESSING {}", path.display());

    let extraction = extractor.parse_document(path)?;
    if extraction.record_count() == 0 {
        tracing::error!("FILE no data from {}", path.display());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        export::write_json(&mut out, &extraction)?;
    } else {
        export::write_report(&mut out, &extraction)?;
    }

    if let Some(output_dir) = config.output_dir() {
        let written = export::write_csv(output_dir, &extraction)?;
        tracing::info!("wrote {} CSV file(s) for {}", written.len(), path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn filename_and_directory_are_exclusive() {
        assert!(Cli::try_parse_from(["ccda-omop"]).is_err());
        assert!(Cli::try_parse_from(["ccda-omop", "-f", "a.xml", "-d", "docs"]).is_err());

        let cli = Cli::try_parse_from(["ccda-omop", "-d", "docs", "--hash-values"]).unwrap();
        assert_eq!(cli.directory, Some(PathBuf::from("docs")));
        assert!(cli.hash_values);
    }

    #[test]
    fn directory_mode_lists_xml_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.xml", "a.XML", "notes.txt", "c.xml"] {
            std::fs::write(dir.path().join(name), "<x/>").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.xml")).unwrap();

        let names: Vec<_> = document_files(dir.path())
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.XML", "b.xml", "c.xml"]);
    }
}
