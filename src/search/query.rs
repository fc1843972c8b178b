//! Abstract search queries and the backend-neutral query DSL

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A filter value: a single value or a set of accepted values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Many(Vec<Value>),
    One(Value),
}

impl FilterValue {
    /// Accepted values as a slice-like vector
    pub fn values(&self) -> Vec<&Value> {
        match self {
            FilterValue::Many(values) => values.iter().collect(),
            FilterValue::One(value) => vec![value],
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::One(Value::from(value))
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::One(Value::from(value))
    }
}

impl From<Vec<&str>> for FilterValue {
    fn from(values: Vec<&str>) -> Self {
        FilterValue::Many(values.into_iter().map(Value::from).collect())
    }
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => FilterValue::Many(values),
            other => FilterValue::One(other),
        }
    }
}

/// Free-text query as issued by callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Search term
    pub term: String,

    /// Field filters. The default translator ignores them; custom
    /// translators may apply them.
    #[serde(default)]
    pub filters: BTreeMap<String, FilterValue>,

    /// Types to search. `None` or empty means every known type.
    #[serde(default)]
    pub types: Option<Vec<String>>,
}

impl SearchQuery {
    /// Create a new search query
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            ..Default::default()
        }
    }

    /// Restrict to the given types
    pub fn with_types(mut self, types: Vec<impl Into<String>>) -> Self {
        self.types = Some(types.into_iter().map(|t| t.into()).collect());
        self
    }

    /// Add a field filter
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Requested types, `None` when every type should be searched
    pub fn requested_types(&self) -> Option<&[String]> {
        self.types.as_deref().filter(|t| !t.is_empty())
    }
}

/// Fuzziness of a multi-field match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fuzziness {
    /// Edit distance derived from term length: 0 for 1-2 chars, 1 for 3-5, 2 above
    Auto,
    /// Fixed maximum edit distance
    Fixed(u8),
}

impl Fuzziness {
    /// Maximum edit distance for a term of `len` characters
    pub fn distance_for(&self, len: usize) -> u8 {
        match self {
            Fuzziness::Auto => match len {
                0..=2 => 0,
                3..=5 => 1,
                _ => 2,
            },
            Fuzziness::Fixed(d) => (*d).min(2),
        }
    }
}

/// Boolean combination of clauses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    #[serde(default)]
    pub must: Vec<QueryDsl>,
    #[serde(default)]
    pub should: Vec<QueryDsl>,
    /// Like `must` but does not contribute to scoring
    #[serde(default)]
    pub filter: Vec<QueryDsl>,
    #[serde(default)]
    pub must_not: Vec<QueryDsl>,
}

/// Backend-neutral query tree every backend knows how to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryDsl {
    MatchAll,
    MatchNone,
    /// Fuzzy match of `query` against any of `fields`. An empty field list
    /// means every field of the target indices.
    MultiMatch {
        query: String,
        fields: Vec<String>,
        fuzziness: Fuzziness,
        minimum_should_match: u32,
    },
    /// Exact value match
    Term { field: String, value: Value },
    /// Exact match against any of the values
    Terms { field: String, values: Vec<Value> },
    Bool(BoolQuery),
}

impl QueryDsl {
    /// Fuzzy OR match across fields, requiring one field to match
    pub fn fuzzy_multi_match(query: impl Into<String>, fields: Vec<String>) -> Self {
        QueryDsl::MultiMatch {
            query: query.into(),
            fields,
            fuzziness: Fuzziness::Auto,
            minimum_should_match: 1,
        }
    }
}

/// A query in the engine's native form, plus the types it targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedQuery {
    /// Types to search; `None` targets every alias
    pub document_types: Option<Vec<String>>,

    /// Query tree
    pub query: QueryDsl,

    /// Maximum number of hits; the engine default applies when `None`
    pub size: Option<usize>,
}

impl TranslatedQuery {
    pub fn new(query: QueryDsl, document_types: Option<Vec<String>>) -> Self {
        Self {
            document_types,
            query,
            size: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Which indices a search runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexTarget {
    /// Explicit alias names; aliases that do not exist contribute nothing
    Aliases(Vec<String>),
    /// Every alias matching a `*` wildcard pattern
    Pattern(String),
}

impl IndexTarget {
    /// Comma separated selector as used in REST paths
    pub fn selector(&self) -> String {
        match self {
            IndexTarget::Aliases(aliases) => aliases.join(","),
            IndexTarget::Pattern(pattern) => pattern.clone(),
        }
    }
}
