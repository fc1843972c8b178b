//! Indexable documents and search results

use crate::search::error::{SearchError, SearchResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An indexable document: an ordered mapping of field name to value.
///
/// The document type is not stored on the document itself. It is the
/// argument of the indexing call, so every document of one call shares it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(BTreeMap<String, Value>);

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON value, which must be an object
    pub fn from_json(value: Value) -> SearchResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(SearchError::Serialization(format!(
                "document must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Add a field (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Get a field value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Field names in order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over fields in order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All text fragments stored under a field, flattening arrays and objects
    pub fn text_values(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(value) = self.0.get(name) {
            collect_text(value, &mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert to a JSON object value
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for Document {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push(s.clone()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A document the backend refused during a bulk load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFailure {
    /// Position of the document in the indexing call
    pub position: usize,

    /// The rejected document
    pub document: Document,

    /// Backend status for the item (429 means the backend was too busy)
    pub status: u16,

    /// Backend supplied reason
    pub cause: String,
}

impl DocumentFailure {
    pub fn new(position: usize, document: Document, status: u16, cause: impl Into<String>) -> Self {
        Self {
            position,
            document,
            status,
            cause: cause.into(),
        }
    }

    /// Whether retrying the same document may succeed
    pub fn is_retryable(&self) -> bool {
        self.status == 429
    }
}

/// A single search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    /// Document type the hit belongs to
    #[serde(rename = "type")]
    pub doc_type: String,

    /// Stored document
    pub document: Document,
}

/// Relevance ordered search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResultSet {
    pub results: Vec<SearchResultItem>,
}

impl SearchResultSet {
    pub fn new(results: Vec<SearchResultItem>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchResultItem> {
        self.results.iter()
    }

    /// Whether the set holds a document equal to `document`
    pub fn contains(&self, document: &Document) -> bool {
        self.results.iter().any(|r| &r.document == document)
    }

    /// Hits of a single type
    pub fn of_type<'a>(&'a self, doc_type: &'a str) -> impl Iterator<Item = &'a Document> + 'a {
        self.results
            .iter()
            .filter(move |r| r.doc_type == doc_type)
            .map(|r| &r.document)
    }
}
