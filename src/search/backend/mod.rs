//! Transport bindings to concrete search stores
//!
//! A [`BackendClient`] exposes the handful of index and alias primitives the
//! reindex protocol needs. Everything above this layer is backend agnostic.

mod elasticsearch;
mod memory;

pub use elasticsearch::{render_query, ElasticsearchBackend};
pub use memory::MemoryBackend;

use crate::search::document::Document;
use crate::search::error::SearchResult;
use crate::search::query::{IndexTarget, TranslatedQuery};
use async_trait::async_trait;

/// One step of an alias update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    /// Unbind `alias` from every index matching `index_pattern`
    Remove { index_pattern: String, alias: String },
    /// Bind `alias` to `index`
    Add { index: String, alias: String },
}

/// Outcome of a single document within a bulk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemOutcome {
    Indexed,
    Failed { status: u16, reason: String },
}

impl BulkItemOutcome {
    pub fn is_indexed(&self) -> bool {
        matches!(self, BulkItemOutcome::Indexed)
    }
}

/// A raw search hit as returned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    /// Physical index the hit came from
    pub index: String,
    /// Stored document
    pub source: Document,
    pub score: Option<f32>,
}

/// Primitive operations of a search store
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Create an empty physical index
    async fn create_index(&self, index: &str) -> SearchResult<()>;

    /// Load documents into an index. Returns one outcome per document, in
    /// input order. Documents are searchable once this returns.
    async fn bulk_load(&self, index: &str, documents: &[Document])
        -> SearchResult<Vec<BulkItemOutcome>>;

    /// Indices currently bound to `alias`; empty when the alias does not exist
    async fn list_aliases(&self, alias: &str) -> SearchResult<Vec<String>>;

    /// Indices whose name matches the `*` wildcard `pattern`
    async fn list_indices(&self, pattern: &str) -> SearchResult<Vec<String>>;

    /// Apply all actions as a single atomic step
    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()>;

    /// Delete indices; missing indices are ignored
    async fn delete_indices(&self, indices: &[String]) -> SearchResult<()>;

    /// Run a query against the target, hits ordered by relevance
    async fn search(&self, target: &IndexTarget, query: &TranslatedQuery)
        -> SearchResult<Vec<RawHit>>;
}

/// Match `name` against a pattern where `*` stands for any run of characters
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }

    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
