use std::path::PathBuf;

use crate::xpath::PathSyntaxError;

/// Errors raised while constructing a mapping table.
///
/// These are the only errors that stop work before any document is read: a table that
/// fails to build is never used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mapping table schema mismatch at {path}: {message}")]
    Schema { path: String, message: String },

    #[error("{domain}/{field}: config_type {kind} requires key '{key}'")]
    MissingKey {
        domain: String,
        field: String,
        kind: &'static str,
        key: &'static str,
    },

    #[error("{domain}/{field}: {source}")]
    InvalidPath {
        domain: String,
        field: String,
        #[source]
        source: PathSyntaxError,
    },

    #[error("{domain}/{field}: invalid attribute '{attribute}': {reason}")]
    InvalidAttribute {
        domain: String,
        field: String,
        attribute: String,
        reason: String,
    },

    #[error(
        "{domain}/{field}: unknown transformer '{name}'; register it before building the table"
    )]
    UnknownTransformer {
        domain: String,
        field: String,
        name: String,
    },

    #[error("domain {domain} declares more than one DOMAIN field ({first}, {second})")]
    MultipleDomainFields {
        domain: String,
        first: String,
        second: String,
    },

    #[error("domain and field names cannot be empty (in '{0}')")]
    EmptyName(String),

    #[error("failed to read mapping file {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load vocabulary: {0}")]
    Vocabulary(#[from] omop_vocab::VocabError),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Structural failures for one domain of one document. Sibling domains are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("domain {domain} lacks a ROOT element")]
    MissingRoot { domain: String },

    #[error("couldn't find root element for {domain} with {path}")]
    NoRootElements { domain: String, path: String },
}

/// Failures that prevent a document from being processed at all.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse XML in {path}: {source}", path = path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

/// Failures while writing exported tables.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error writing {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ExportResult<T> = std::result::Result<T, ExportError>;
