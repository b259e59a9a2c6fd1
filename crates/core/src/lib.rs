//! # CCDA Core
//!
//! Table-driven extraction of OMOP rows from CCDA documents.
//!
//! A [`MappingTable`] describes, per OMOP domain, where each output field comes from:
//! - a ROOT path selecting the repeating elements (one record per element)
//! - FIELD and PK values read from elements below each root
//! - FK values read back from the [`KeyRegistry`]
//! - DERIVED and DOMAIN values computed by named transformers
//! - HASH digests and priority groups choosing between candidates
//!
//! The [`Extractor`] runs every domain over a document and returns cleaned
//! [`OutputRecord`]s in which each value carries its provenance.
//!
//! **No process concerns**: logging setup, command-line parsing and file discovery belong in the
//! binaries.

pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod export;
pub mod keys;
pub mod mapping;
pub mod process;
pub mod record;
pub mod resolve;
pub mod transform;
pub mod xpath;

pub use config::ExtractorConfig;
pub use driver::{DocumentExtraction, DomainExtraction, Extractor};
pub use error::{
    ConfigError, ConfigResult, DomainError, ExportError, ExportResult, ExtractError,
    ExtractResult,
};
pub use keys::KeyRegistry;
pub use mapping::{DomainTable, FieldKind, FieldSpec, HashMode, MappingTable};
pub use record::{OutputRecord, Provenance, Resolved};
pub use transform::{Arguments, TransformError, Transformer, TransformerRegistry};

pub use omop_types::Value;
