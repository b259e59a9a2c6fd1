//! Value transformers referenced by DERIVED and DOMAIN fields.
//!
//! A mapping table names its transformers (`FUNCTION: map_hl7_to_omop_concept_id`). Names
//! are resolved against a [`TransformerRegistry`] once, when the table is built, so a table
//! never holds a reference that cannot be called.
//!
//! Transformers receive an [`Arguments`] map (parameter name → value of the referenced
//! field) and return a single value. An argument whose input field was missing from the
//! record is absent from the map; an input field that resolved to null is present as `None`.

use indexmap::IndexMap;
use omop_types::Value;
use omop_vocab::Vocabulary;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Errors a transformer may report. The caller logs them and stores a null value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("argument '{name}' has unexpected value {value}")]
    InvalidArgument { name: String, value: String },

    #[error("{0}")]
    Failed(String),
}

pub type TransformResult = Result<Option<Value>, TransformError>;

/// Signature shared by all transformers.
pub type TransformFn = dyn Fn(&Arguments) -> TransformResult + Send + Sync;

/// Arguments passed to a transformer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: IndexMap<String, Option<Value>>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Option<Value>) {
        self.values.insert(name.into(), value);
    }

    /// Value of an argument; `None` if absent or null.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(Option::as_ref)
    }

    /// Fails with [`TransformError::MissingArgument`] if `name` was never supplied.
    pub fn require(&self, name: &str) -> Result<Option<&Value>, TransformError> {
        self.values
            .get(name)
            .map(Option::as_ref)
            .ok_or_else(|| TransformError::MissingArgument(name.to_owned()))
    }

    /// Like [`Arguments::require`] but renders the value as text.
    pub fn require_text(&self, name: &str) -> Result<Option<String>, TransformError> {
        Ok(self.require(name)?.map(Value::to_string))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (name, value)) in self.values.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(value) => write!(f, "{name}: {value}")?,
                None => write!(f, "{name}: None")?,
            }
        }
        f.write_str("}")
    }
}

/// A named, callable transformer.
#[derive(Clone)]
pub struct Transformer {
    name: String,
    func: Arc<TransformFn>,
}

impl Transformer {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Arguments) -> TransformResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &Arguments) -> TransformResult {
        (self.func)(args)
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transformer").field(&self.name).finish()
    }
}

/// Transformers available to mapping tables, by name.
#[derive(Debug, Clone, Default)]
pub struct TransformerRegistry {
    entries: HashMap<String, Transformer>,
}

impl TransformerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in transformers, with concept lookups served by `vocabulary`.
    pub fn with_builtins(vocabulary: Vocabulary) -> Self {
        let mut registry = Self::new();
        let vocab = vocabulary.clone();
        registry.register("map_hl7_to_omop_concept_id", move |args| {
            map_hl7_to_omop_concept_id(&vocab, args)
        });
        let vocab = vocabulary;
        registry.register("map_hl7_to_omop_domain_id", move |args| {
            map_hl7_to_omop_domain_id(&vocab, args)
        });
        registry.register("cast_string_to_float", cast_string_to_float);
        registry.register("cast_string_to_int", cast_string_to_int);
        registry.register("cast_string_to_concept_id", cast_string_to_concept_id);
        registry
    }

    /// Adds or replaces a transformer.
    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&Arguments) -> TransformResult + Send + Sync + 'static,
    {
        self.entries
            .insert(name.to_owned(), Transformer::new(name, func));
    }

    pub fn resolve(&self, name: &str) -> Option<Transformer> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn map_hl7_to_omop_concept_id(vocab: &Vocabulary, args: &Arguments) -> TransformResult {
    let (Some(code), Some(oid)) = (
        args.require_text("concept_code")?,
        args.require_text("vocabulary_oid")?,
    ) else {
        return Ok(None);
    };
    Ok(vocab
        .concept_for_oid(&oid, &code)
        .map(|concept| Value::Integer(concept.concept_id)))
}

fn map_hl7_to_omop_domain_id(vocab: &Vocabulary, args: &Arguments) -> TransformResult {
    let (Some(code), Some(oid)) = (
        args.require_text("concept_code")?,
        args.require_text("vocabulary_oid")?,
    ) else {
        return Ok(None);
    };
    Ok(vocab
        .concept_for_oid(&oid, &code)
        .map(|concept| Value::Text(concept.domain_id)))
}

fn cast_string_to_float(args: &Arguments) -> TransformResult {
    match args.require("input")? {
        None => Ok(None),
        Some(Value::Float(x)) => Ok(Some(Value::Float(*x))),
        Some(Value::Integer(i)) => Ok(Some(Value::Float(*i as f64))),
        Some(Value::Text(text)) => Ok(text.trim().parse::<f64>().ok().map(Value::Float)),
    }
}

fn cast_string_to_int(args: &Arguments) -> TransformResult {
    match args.require("input")? {
        None => Ok(None),
        Some(Value::Integer(i)) => Ok(Some(Value::Integer(*i))),
        Some(Value::Float(_)) => Ok(None),
        Some(Value::Text(text)) => Ok(text.trim().parse::<i64>().ok().map(Value::Integer)),
    }
}

/// Coded results carry a concept id directly; anything non-numeric has no concept.
fn cast_string_to_concept_id(args: &Arguments) -> TransformResult {
    cast_string_to_int(args)
}
