//! Constants used throughout the extractor.

/// HL7 v3 namespace, the default namespace of a CCDA document.
pub const HL7_NAMESPACE: &str = "urn:hl7-org:v3";

/// XML Schema instance namespace (`xsi:type`).
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// HL7 SDTC extension namespace.
pub const SDTC_NAMESPACE: &str = "urn:hl7-org:sdtc";

/// Attribute sentinel meaning "the element's text content".
pub const TEXT_ATTRIBUTE: &str = "#text";

/// Name of the bookkeeping field that records which root path produced a record.
pub const ROOT_PATH_FIELD: &str = "root_path";

/// Separator used when joining hash inputs.
pub const HASH_SEPARATOR: &str = "-";

/// Default directory for per-file and per-domain log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// File extension of documents picked up in directory mode.
pub const DOCUMENT_EXTENSION: &str = "xml";
