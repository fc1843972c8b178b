//! Pluggable document search with generation based reindexing
//!
//! This module provides a search engine facade that hides the store behind
//! it, including:
//!
//! - **Full Reindex per Type**: every `index()` call builds a new generation
//! - **Zero-Downtime Swaps**: readers resolve types through aliases that are
//!   rebound in a single atomic step
//! - **Stale Cleanup**: replaced generations are pruned after the swap
//! - **Pluggable Translation**: the query translator can be replaced at runtime
//! - **Multiple Stores**: in-process tantivy indices or an Elasticsearch cluster
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │           SearchEngine facade                    │
//! ├─────────────────────────────────────────────────┤
//! │  - index()   - query()   - set_translator()     │
//! └─────────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────────┐  ┌───────────────────────┐
//! │   Index Manager      │  │  Query Translator     │
//! ├──────────────────────┤  ├───────────────────────┤
//! │ Building → Swapping  │  │ reads the Document    │
//! │ → Pruning            │  │ Type Registry         │
//! └──────────────────────┘  └───────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │              Backend Client                      │
//! ├─────────────────────────────────────────────────┤
//! │  - MemoryBackend (tantivy RAM indices)          │
//! │  - ElasticsearchBackend (REST)                  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use docsearch::search::{Document, InMemoryEngine, SearchConfig, SearchEngine, SearchQuery};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = InMemoryEngine::in_memory(SearchConfig::default())?;
//!
//!     let doc = Document::new()
//!         .with_field("title", "payments-gateway")
//!         .with_field("owner", "team-a");
//!     engine.index("component", &[doc]).await?;
//!
//!     let results = engine.query(&SearchQuery::new("paymnts")).await?;
//!     println!("Found {} documents", results.len());
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
mod config;
mod document;
mod error;
mod index;
mod query;
mod registry;
mod service;
mod translator;

pub use backend::{
    render_query, AliasAction, BackendClient, BulkItemOutcome, ElasticsearchBackend,
    MemoryBackend, RawHit,
};
pub use config::{
    decode_cloud_id, AuthConfig, Credentials, ElasticsearchConfig, EngineKind, Provider,
    ReindexPolicy, SearchConfig, SearchConfigBuilder, MAX_RETRY_BACKOFF_MS, MIN_WRITER_HEAP_SIZE,
};
pub use document::{Document, DocumentFailure, SearchResultItem, SearchResultSet};
pub use error::{IndexingError, SearchError, SearchResult};
pub use index::{
    alias_name, validate_document_type, GenerationClock, IndexDescriptor, IndexManager,
    IndexName, IndexReport, ReindexState, NAME_SEPARATOR,
};
pub use query::{BoolQuery, FilterValue, Fuzziness, IndexTarget, QueryDsl, SearchQuery, TranslatedQuery};
pub use registry::{DocumentTypeRegistry, DocumentTypeSchema};
pub use service::{create_engine, ClusterEngine, InMemoryEngine, SearchEngine, SearchService};
pub use translator::{filter_clauses, DefaultTranslator, FilteringTranslator, QueryTranslator};
