//! Canonical documents
//!
//! A canonical document is the store-ready form of a harvested record. Two documents
//! are semantically equal when the digests of their canonical forms match: JSON with
//! object keys sorted, or N-Triples as a sorted, de-duplicated statement set.

use harvest_common::digest::ContentDigest;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{PipelineError, Result};
use crate::model::QueueMessage;

pub const CONTENT_TYPE_JSON_LD: &str = "application/ld+json";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_N_TRIPLES: &str = "application/n-triples";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    JsonLd,
    Json,
    NTriples,
}

impl DocumentFormat {
    /// Resolve a content type, ignoring parameters such as `charset`
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            CONTENT_TYPE_JSON_LD => Ok(DocumentFormat::JsonLd),
            CONTENT_TYPE_JSON => Ok(DocumentFormat::Json),
            CONTENT_TYPE_N_TRIPLES => Ok(DocumentFormat::NTriples),
            _ => Err(PipelineError::validation(format!(
                "Unsupported document content type '{}'",
                content_type
            ))),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            DocumentFormat::JsonLd => CONTENT_TYPE_JSON_LD,
            DocumentFormat::Json => CONTENT_TYPE_JSON,
            DocumentFormat::NTriples => CONTENT_TYPE_N_TRIPLES,
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalDocument {
    pub body: Vec<u8>,
    pub content_type: String,
}

impl CanonicalDocument {
    pub fn new(body: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
        }
    }

    pub fn from_message(message: &QueueMessage) -> Self {
        Self::new(message.body.clone(), message.content_type.clone())
    }

    pub fn format(&self) -> Result<DocumentFormat> {
        DocumentFormat::from_content_type(&self.content_type)
    }

    /// Check that the body parses as its declared format
    pub fn validate(&self) -> Result<()> {
        self.canonical_form().map(|_| ())
    }

    /// Digest of the canonical form
    pub fn digest(&self) -> Result<ContentDigest> {
        Ok(match self.canonical_form()? {
            CanonicalForm::Json(bytes) => ContentDigest::of(&bytes),
            CanonicalForm::Statements(statements) => {
                ContentDigest::of_parts(statements.iter().map(|s| s.as_bytes()), b"\n")
            }
        })
    }

    pub fn semantically_equals(&self, other: &CanonicalDocument) -> Result<bool> {
        Ok(self.digest()? == other.digest()?)
    }

    fn canonical_form(&self) -> Result<CanonicalForm> {
        match self.format()? {
            DocumentFormat::JsonLd | DocumentFormat::Json => {
                let value: Value = serde_json::from_slice(&self.body)
                    .map_err(|e| PipelineError::validation(format!("Malformed JSON: {}", e)))?;
                if !value.is_object() && !value.is_array() {
                    return Err(PipelineError::validation(
                        "JSON document must be an object or an array",
                    ));
                }
                let bytes = serde_json::to_vec(&sorted(value))
                    .map_err(|e| PipelineError::validation(e.to_string()))?;
                Ok(CanonicalForm::Json(bytes))
            }
            DocumentFormat::NTriples => {
                let text = std::str::from_utf8(&self.body)
                    .map_err(|e| PipelineError::validation(format!("N-Triples not UTF-8: {}", e)))?;
                let mut statements = BTreeSet::new();
                for (n, line) in text.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    statements.insert(normalize_statement(line).ok_or_else(|| {
                        PipelineError::validation(format!(
                            "Malformed N-Triples statement at line {}",
                            n + 1
                        ))
                    })?);
                }
                if statements.is_empty() {
                    return Err(PipelineError::validation("N-Triples document has no statements"));
                }
                Ok(CanonicalForm::Statements(statements))
            }
        }
    }
}

enum CanonicalForm {
    Json(Vec<u8>),
    Statements(BTreeSet<String>),
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sorted(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// `<s> <p> <o> .` with single spaces, or None if the line is not a statement
fn normalize_statement(line: &str) -> Option<String> {
    let body = line.strip_suffix('.')?.trim_end();
    let (subject, rest) = body.split_once(char::is_whitespace)?;
    let (predicate, object) = rest.trim_start().split_once(char::is_whitespace)?;
    let object = object.trim();

    let subject_ok = (subject.starts_with('<') && subject.ends_with('>')) || subject.starts_with("_:");
    let predicate_ok = predicate.starts_with('<') && predicate.ends_with('>');
    if !subject_ok || !predicate_ok || object.is_empty() {
        return None;
    }
    Some(format!("{} {} {} .", subject, predicate, object))
}
