//! Search engine facade

use crate::search::backend::{BackendClient, ElasticsearchBackend, MemoryBackend};
use crate::search::config::{EngineKind, SearchConfig};
use crate::search::document::{Document, SearchResultItem, SearchResultSet};
use crate::search::error::{SearchError, SearchResult};
use crate::search::index::{
    validate_document_type, IndexManager, IndexName, IndexReport, NAME_SEPARATOR,
};
use crate::search::query::{IndexTarget, SearchQuery};
use crate::search::registry::DocumentTypeRegistry;
use crate::search::translator::{DefaultTranslator, QueryTranslator};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The operations document producers and query callers may invoke
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Replace every document of `doc_type` with `documents`
    async fn index(&self, doc_type: &str, documents: &[Document]) -> SearchResult<IndexReport>;

    /// Run a query. Unknown types contribute no results.
    async fn query(&self, query: &SearchQuery) -> SearchResult<SearchResultSet>;

    /// Install the translator used by queries started from now on
    fn set_translator(&self, translator: Arc<dyn QueryTranslator>);
}

/// Search engine over a concrete backend
pub struct SearchService<B> {
    index_manager: IndexManager<B>,
    registry: DocumentTypeRegistry,
    translator: RwLock<Arc<dyn QueryTranslator>>,
    config: SearchConfig,
}

/// Engine holding its indices in process memory
pub type InMemoryEngine = SearchService<MemoryBackend>;

/// Engine backed by an Elasticsearch compatible cluster
pub type ClusterEngine = SearchService<ElasticsearchBackend>;

impl<B: BackendClient> SearchService<B> {
    /// Create a service over an existing backend
    pub fn with_backend(backend: Arc<B>, config: SearchConfig) -> SearchResult<Self> {
        config.validate()?;
        info!(
            backend = backend.name(),
            alias_postfix = %config.alias_postfix,
            reindex_policy = %config.reindex_policy,
            "Search engine initialized"
        );

        Ok(Self {
            index_manager: IndexManager::new(backend, config.clone()),
            registry: DocumentTypeRegistry::new(),
            translator: RwLock::new(Arc::new(DefaultTranslator)),
            config,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn registry(&self) -> &DocumentTypeRegistry {
        &self.registry
    }

    pub fn index_manager(&self) -> &IndexManager<B> {
        &self.index_manager
    }

    pub fn backend(&self) -> &Arc<B> {
        self.index_manager.backend()
    }

    /// Translator currently installed
    pub fn translator(&self) -> Arc<dyn QueryTranslator> {
        Arc::clone(&self.translator.read())
    }

    /// Indices a translated query for `types` is sent to
    fn target(&self, types: Option<&[String]>) -> IndexTarget {
        match types.filter(|t| !t.is_empty()) {
            Some(types) => IndexTarget::Aliases(
                types
                    .iter()
                    .filter(|t| validate_document_type(t).is_ok())
                    .map(|t| self.index_manager.alias_for(t))
                    .collect(),
            ),
            None => IndexTarget::Pattern(format!(
                "*{}{}",
                NAME_SEPARATOR, self.config.alias_postfix
            )),
        }
    }
}

impl InMemoryEngine {
    pub fn in_memory(config: SearchConfig) -> SearchResult<Self> {
        let backend = MemoryBackend::new(config.writer_heap_size);
        Self::with_backend(Arc::new(backend), config)
    }
}

impl ClusterEngine {
    pub fn cluster(config: SearchConfig) -> SearchResult<Self> {
        let es_config = config.elasticsearch.as_ref().ok_or_else(|| {
            SearchError::Configuration(
                "Elasticsearch engine requires an 'elasticsearch' section".to_string(),
            )
        })?;
        let backend = ElasticsearchBackend::new(es_config)?;
        Self::with_backend(Arc::new(backend), config)
    }
}

#[async_trait]
impl<B: BackendClient + 'static> SearchEngine for SearchService<B> {
    async fn index(&self, doc_type: &str, documents: &[Document]) -> SearchResult<IndexReport> {
        let report = self.index_manager.reindex(doc_type, documents).await?;

        let failed: HashSet<usize> = report
            .failures
            .iter()
            .flat_map(|f| f.failures.iter().map(|d| d.position))
            .collect();
        let accepted = documents
            .iter()
            .enumerate()
            .filter(|(position, _)| !failed.contains(position))
            .map(|(_, document)| document);
        self.registry.record(doc_type, accepted);

        Ok(report)
    }

    async fn query(&self, query: &SearchQuery) -> SearchResult<SearchResultSet> {
        let started = Instant::now();

        // Snapshot: a later set_translator does not affect this call
        let translator = self.translator();
        let mut translated = translator.translate(query, &self.registry)?;

        let size = translated
            .size
            .unwrap_or(self.config.max_results)
            .min(self.config.max_results);
        translated.size = Some(size);
        let target = self.target(translated.document_types.as_deref());

        let hits = timeout(
            Duration::from_secs(self.config.query_timeout_secs),
            self.backend().search(&target, &translated),
        )
        .await
        .map_err(|_| {
            warn!(term = %query.term, target = %target.selector(), "Query timed out");
            SearchError::Query(format!(
                "query exceeded {}s",
                self.config.query_timeout_secs
            ))
        })?
        .map_err(|e| match e {
            SearchError::Query(_) => e,
            SearchError::Backend { status, message } => {
                SearchError::Query(format!("search failed ({}): {}", status, message))
            }
            other => SearchError::Query(format!("search failed: {}", other)),
        })?;

        let results: Vec<SearchResultItem> = hits
            .into_iter()
            .filter_map(|hit| match IndexName::parse(&hit.index) {
                Some(name) => Some(SearchResultItem {
                    doc_type: name.doc_type,
                    document: hit.source,
                }),
                None => {
                    debug!(index = %hit.index, "Skipping hit from unmanaged index");
                    None
                }
            })
            .collect();

        debug!(
            term = %query.term,
            target = %target.selector(),
            hits = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query executed"
        );

        Ok(SearchResultSet::new(results))
    }

    fn set_translator(&self, translator: Arc<dyn QueryTranslator>) {
        *self.translator.write() = translator;
        info!("Query translator replaced");
    }
}

/// Create the engine selected by `config.engine`
pub fn create_engine(config: &SearchConfig) -> SearchResult<Arc<dyn SearchEngine>> {
    config.validate()?;

    match config.engine {
        EngineKind::Memory => {
            info!(writer_heap_size = config.writer_heap_size, "Initializing in-memory search engine");
            Ok(Arc::new(InMemoryEngine::in_memory(config.clone())?))
        }
        EngineKind::Elasticsearch => {
            info!("Initializing Elasticsearch search engine");
            Ok(Arc::new(ClusterEngine::cluster(config.clone())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::config::{ElasticsearchConfig, Provider, SearchConfigBuilder};
    use crate::search::query::{QueryDsl, TranslatedQuery};
    use crate::search::registry::DocumentTypeRegistry;
    use serde_json::json;

    fn engine() -> InMemoryEngine {
        InMemoryEngine::in_memory(SearchConfig::default()).unwrap()
    }

    fn component(name: &str, owner: &str) -> Document {
        Document::new()
            .with_field("name", name)
            .with_field("owner", owner)
    }

    #[tokio::test]
    async fn test_index_then_query() {
        let engine = engine();
        let payments = component("payments-gateway", "team-a");
        engine
            .index("component", &[payments.clone(), component("checkout", "team-b")])
            .await
            .unwrap();

        let results = engine.query(&SearchQuery::new("payments")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.results[0].doc_type, "component");
        assert_eq!(results.results[0].document, payments);
    }

    #[tokio::test]
    async fn test_registry_updated_after_index() {
        let engine = engine();
        engine
            .index("component", &[component("a", "b")])
            .await
            .unwrap();
        let schema = engine.registry().schema("component").unwrap();
        assert!(schema.contains("name") && schema.contains("owner"));
    }

    #[tokio::test]
    async fn test_failed_index_leaves_registry_untouched() {
        let engine = engine();
        let err = engine.index("component", &[]).await.unwrap_err();
        assert!(matches!(err, SearchError::EmptyDocumentSet { .. }));
        assert!(!engine.registry().contains("component"));
    }

    #[tokio::test]
    async fn test_query_is_scoped_by_type() {
        let engine = engine();
        engine
            .index("component", &[component("shared-term", "x")])
            .await
            .unwrap();
        engine
            .index(
                "techdocs",
                &[Document::new().with_field("title", "shared-term guide")],
            )
            .await
            .unwrap();

        let all = engine.query(&SearchQuery::new("shared")).await.unwrap();
        assert_eq!(all.len(), 2);

        let scoped = engine
            .query(&SearchQuery::new("shared").with_types(vec!["techdocs"]))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped.results[0].doc_type, "techdocs");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_types_yield_nothing() {
        let engine = engine();
        engine
            .index("component", &[component("x", "y")])
            .await
            .unwrap();

        for types in [vec!["unknown-type"], vec!["a,b"], vec!["*"]] {
            let results = engine
                .query(&SearchQuery::new("x").with_types(types))
                .await
                .unwrap();
            assert!(results.is_empty());
        }
    }

    #[tokio::test]
    async fn test_set_translator_takes_effect() {
        let engine = engine();
        engine
            .index(
                "component",
                &[component("alpha", "team-a"), component("beta", "team-b")],
            )
            .await
            .unwrap();

        engine.set_translator(Arc::new(
            |_: &SearchQuery, _: &DocumentTypeRegistry| -> SearchResult<TranslatedQuery> {
                Ok(TranslatedQuery::new(
                    QueryDsl::Term {
                        field: "owner".into(),
                        value: json!("team-b"),
                    },
                    None,
                ))
            },
        ));

        let results = engine.query(&SearchQuery::new("alpha")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.results[0].document, component("beta", "team-b"));
    }

    #[tokio::test]
    async fn test_max_results_caps_translator_size() {
        let config = SearchConfigBuilder::new().max_results(2).build();
        let engine = InMemoryEngine::in_memory(config).unwrap();
        let docs: Vec<Document> = (0..5).map(|i| component(&format!("svc{}", i), "o")).collect();
        engine.index("component", &docs).await.unwrap();

        engine.set_translator(Arc::new(
            |_: &SearchQuery, _: &DocumentTypeRegistry| -> SearchResult<TranslatedQuery> {
                Ok(TranslatedQuery::new(QueryDsl::MatchAll, None).with_size(50))
            },
        ));
        let results = engine.query(&SearchQuery::new("")).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_create_engine_memory() {
        assert!(create_engine(&SearchConfig::default()).is_ok());
    }

    #[test]
    fn test_create_engine_rejects_incomplete_cluster_config() {
        let config = SearchConfigBuilder::new()
            .elasticsearch(ElasticsearchConfig::new(Provider::Custom))
            .build();
        assert!(matches!(
            create_engine(&config),
            Err(SearchError::Configuration(_))
        ));
    }
}
