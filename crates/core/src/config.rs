//! Extractor runtime configuration.
//!
//! Settings are resolved once at startup (command line, then environment, then defaults)
//! and passed into the extractor. Nothing below reads environment variables while documents
//! are being processed.

use omop_vocab::{ConceptTable, OidMap, Vocabulary};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::DEFAULT_LOG_DIR;
use crate::driver::Extractor;
use crate::error::{ConfigError, ConfigResult};
use crate::mapping::{HashMode, MappingTable};
use crate::transform::TransformerRegistry;

/// Configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    log_dir: PathBuf,
    output_dir: Option<PathBuf>,
    hash_mode: HashMode,
    log_file_level: tracing::Level,
    mapping_file: Option<PathBuf>,
    concept_file: Option<PathBuf>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            output_dir: None,
            hash_mode: HashMode::default(),
            log_file_level: tracing::Level::WARN,
            mapping_file: None,
            concept_file: None,
        }
    }
}

impl ExtractorConfig {
    /// Create a new `ExtractorConfig`.
    ///
    /// Mapping and concept files must exist when given; an empty log directory is rejected.
    pub fn new(
        log_dir: PathBuf,
        output_dir: Option<PathBuf>,
        hash_mode: HashMode,
        log_file_level: tracing::Level,
        mapping_file: Option<PathBuf>,
        concept_file: Option<PathBuf>,
    ) -> ConfigResult<Self> {
        if log_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidSetting(
                "log directory cannot be empty".into(),
            ));
        }
        if let Some(output_dir) = &output_dir {
            if output_dir.is_file() {
                return Err(ConfigError::InvalidSetting(format!(
                    "output directory {} is an existing file",
                    output_dir.display()
                )));
            }
        }
        for (label, file) in [("mapping", &mapping_file), ("concept", &concept_file)] {
            if let Some(file) = file {
                if !file.is_file() {
                    return Err(ConfigError::InvalidSetting(format!(
                        "{label} file {} does not exist",
                        file.display()
                    )));
                }
            }
        }

        Ok(Self {
            log_dir,
            output_dir,
            hash_mode,
            log_file_level,
            mapping_file,
            concept_file,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn hash_mode(&self) -> HashMode {
        self.hash_mode
    }

    pub fn log_file_level(&self) -> tracing::Level {
        self.log_file_level
    }

    pub fn mapping_file(&self) -> Option<&Path> {
        self.mapping_file.as_deref()
    }

    pub fn concept_file(&self) -> Option<&Path> {
        self.concept_file.as_deref()
    }

    /// The vocabulary: built-in OIDs plus the concept file, or no concepts at all.
    pub fn vocabulary(&self) -> ConfigResult<Vocabulary> {
        match &self.concept_file {
            Some(path) => {
                let concepts = ConceptTable::load(path)?;
                Ok(Vocabulary::new(OidMap::builtin(), Arc::new(concepts)))
            }
            None => {
                tracing::warn!("no concept file configured; concept lookups will find nothing");
                Ok(Vocabulary::without_concepts())
            }
        }
    }

    /// Builds the extractor: vocabulary, built-in transformers and the mapping table.
    pub fn build_extractor(&self) -> ConfigResult<Extractor> {
        let registry = TransformerRegistry::with_builtins(self.vocabulary()?);
        let mapping = match &self.mapping_file {
            Some(path) => MappingTable::load(path, &registry)?,
            None => MappingTable::builtin(&registry)?,
        };
        Ok(Extractor::new(mapping.with_hash_mode(self.hash_mode)))
    }
}

/// Parse an optional path setting; empty or whitespace values count as unset.
pub fn path_from_env_value(value: Option<String>) -> Option<PathBuf> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse the hash mode from an optional string value (`names` or `values`).
///
/// If `value` is `None` or empty/whitespace, returns the default.
pub fn hash_mode_from_env_value(value: Option<String>) -> ConfigResult<HashMode> {
    let value = value
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty());
    match value.as_deref() {
        None => Ok(HashMode::default()),
        Some("names") => Ok(HashMode::FieldNames),
        Some("values") => Ok(HashMode::FieldValues),
        Some(other) => Err(ConfigError::InvalidSetting(format!(
            "unknown hash mode '{other}' (expected 'names' or 'values')"
        ))),
    }
}

/// Parse the log-file level from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns WARN.
pub fn log_level_from_env_value(value: Option<String>) -> ConfigResult<tracing::Level> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    match value {
        None => Ok(tracing::Level::WARN),
        Some(v) => v
            .parse::<tracing::Level>()
            .map_err(|_| ConfigError::InvalidSetting(format!("unknown log level '{v}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_builtin_tables() {
        let config = ExtractorConfig::default();
        assert_eq!(config.log_dir(), Path::new("logs"));
        assert_eq!(config.log_file_level(), tracing::Level::WARN);
        assert!(config.output_dir().is_none());

        let extractor = config.build_extractor().unwrap();
        assert_eq!(extractor.mapping().len(), 3);
        assert_eq!(extractor.mapping().hash_mode(), HashMode::FieldNames);
    }

    #[test]
    fn missing_mapping_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExtractorConfig::new(
            dir.path().join("logs"),
            None,
            HashMode::default(),
            tracing::Level::WARN,
            Some(dir.path().join("mapping.yaml")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting(ref msg) if msg.contains("mapping file")));
    }

    #[test]
    fn mapping_and_concept_files_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mapping = dir.path().join("mapping.yaml");
        std::fs::write(
            &mapping,
            "Person:\n  root: {config_type: ROOT, element: ./recordTarget/patientRole}\n",
        )
        .unwrap();
        let concepts = dir.path().join("CONCEPT.csv");
        std::fs::write(
            &concepts,
            "concept_id\tconcept_name\tdomain_id\tvocabulary_id\tconcept_class_id\tstandard_concept\tconcept_code\tvalid_start_date\tvalid_end_date\tinvalid_reason\n\
             8532\tFEMALE\tGender\tGender\tGender\tS\tF\t19700101\t20991231\t\n",
        )
        .unwrap();

        let config = ExtractorConfig::new(
            dir.path().join("logs"),
            Some(dir.path().join("out")),
            HashMode::FieldValues,
            tracing::Level::INFO,
            Some(mapping),
            Some(concepts),
        )
        .unwrap();

        let vocabulary = config.vocabulary().unwrap();
        let female = vocabulary.concept_for_oid("2.16.840.1.113883.5.1", "F").unwrap();
        assert_eq!(female.concept_id, 8532);

        let extractor = config.build_extractor().unwrap();
        assert_eq!(extractor.mapping().len(), 1);
        assert_eq!(extractor.mapping().hash_mode(), HashMode::FieldValues);
    }

    #[test]
    fn env_values_are_trimmed_and_validated() {
        assert_eq!(path_from_env_value(Some("  ".into())), None);
        assert_eq!(path_from_env_value(Some(" out ".into())), Some(PathBuf::from("out")));

        assert_eq!(hash_mode_from_env_value(None).unwrap(), HashMode::FieldNames);
        assert_eq!(
            hash_mode_from_env_value(Some("Values".into())).unwrap(),
            HashMode::FieldValues
        );
        assert!(hash_mode_from_env_value(Some("both".into())).is_err());

        assert_eq!(log_level_from_env_value(None).unwrap(), tracing::Level::WARN);
        assert_eq!(
            log_level_from_env_value(Some("info".into())).unwrap(),
            tracing::Level::INFO
        );
        assert!(log_level_from_env_value(Some("loud".into())).is_err());
    }
}
