//! In-process backend built on tantivy RAM indices

use crate::search::backend::{wildcard_match, AliasAction, BackendClient, BulkItemOutcome, RawHit};
use crate::search::config::MIN_WRITER_HEAP_SIZE;
use crate::search::document::Document;
use crate::search::error::{SearchError, SearchResult};
use crate::search::query::{BoolQuery, IndexTarget, QueryDsl, TranslatedQuery};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::{
    AllQuery, BooleanQuery, ConstScoreQuery, EmptyQuery, FuzzyTermQuery, Occur, Query, TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value as _, STORED, STRING, TEXT};
use tantivy::tokenizer::{Token, TokenStream};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const SOURCE_FIELD: &str = "_source";
const DEFAULT_HITS: usize = 10;

/// Tantivy fields backing one document field
#[derive(Debug, Clone, Copy)]
struct SegmentField {
    /// Tokenized, for full-text matching
    text: Field,
    /// Untokenized, for exact matching
    raw: Field,
}

/// One bulk batch, indexed into its own immutable RAM index whose schema is
/// derived from the field names present in the batch
struct Segment {
    index: Index,
    reader: IndexReader,
    source: Field,
    fields: BTreeMap<String, SegmentField>,
}

impl Segment {
    fn build(documents: &[Document], writer_heap_size: usize) -> SearchResult<Self> {
        let mut builder = Schema::builder();
        let source = builder.add_text_field(SOURCE_FIELD, STORED);

        let names: BTreeSet<&str> = documents.iter().flat_map(|d| d.field_names()).collect();
        let mut fields = BTreeMap::new();
        for name in names {
            let text = builder.add_text_field(&format!("doc.{}", name), TEXT);
            let raw = builder.add_text_field(&format!("raw.{}", name), STRING);
            fields.insert(name.to_string(), SegmentField { text, raw });
        }

        let index = Index::create_in_ram(builder.build());
        let mut writer: IndexWriter = index.writer_with_num_threads(1, writer_heap_size)?;

        for document in documents {
            let mut doc = TantivyDocument::new();
            doc.add_text(source, serde_json::to_string(document)?);
            for (name, field) in &fields {
                for value in document.text_values(name) {
                    doc.add_text(field.text, &value);
                    doc.add_text(field.raw, &value);
                }
            }
            writer.add_document(doc)?;
        }
        writer.commit()?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            source,
            fields,
        })
    }

    fn tokenize(&self, field: Field, text: &str) -> SearchResult<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(field)?;
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        stream.process(&mut |token: &Token| tokens.push(token.text.clone()));
        Ok(tokens)
    }

    /// Compile the query tree against this segment's schema
    fn compile(&self, dsl: &QueryDsl) -> SearchResult<Box<dyn Query>> {
        match dsl {
            QueryDsl::MatchAll => Ok(Box::new(AllQuery)),
            QueryDsl::MatchNone => Ok(Box::new(EmptyQuery)),
            QueryDsl::MultiMatch {
                query,
                fields,
                fuzziness,
                minimum_should_match,
            } => {
                let targets: Vec<SegmentField> = if fields.is_empty() {
                    self.fields.values().copied().collect()
                } else {
                    fields.iter().filter_map(|f| self.fields.get(f).copied()).collect()
                };

                // token -> clauses over every target field
                let mut per_token: BTreeMap<String, Vec<(Occur, Box<dyn Query>)>> = BTreeMap::new();
                for target in targets {
                    for token in self.tokenize(target.text, query)? {
                        let distance = fuzziness.distance_for(token.chars().count());
                        let term = Term::from_field_text(target.text, &token);
                        let clause: Box<dyn Query> = if distance == 0 {
                            Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs))
                        } else {
                            Box::new(FuzzyTermQuery::new(term, distance, true))
                        };
                        per_token.entry(token).or_default().push((Occur::Should, clause));
                    }
                }

                if per_token.is_empty() {
                    return Ok(Box::new(EmptyQuery));
                }

                // One matching token is enough; larger minimums require every token
                let occur = if *minimum_should_match <= 1 {
                    Occur::Should
                } else {
                    Occur::Must
                };
                let clauses = per_token
                    .into_values()
                    .map(|clauses| (occur, Box::new(BooleanQuery::new(clauses)) as Box<dyn Query>))
                    .collect();
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            QueryDsl::Term { field, value } => match value {
                Value::Array(values) => self.compile_terms(field, values),
                value => Ok(self.exact(field, value)),
            },
            QueryDsl::Terms { field, values } => self.compile_terms(field, values),
            QueryDsl::Bool(bool_query) => self.compile_bool(bool_query),
        }
    }

    fn exact(&self, field: &str, value: &Value) -> Box<dyn Query> {
        let Some(target) = self.fields.get(field) else {
            return Box::new(EmptyQuery);
        };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Box::new(TermQuery::new(
            Term::from_field_text(target.raw, &text),
            IndexRecordOption::Basic,
        ))
    }

    fn compile_terms(&self, field: &str, values: &[Value]) -> SearchResult<Box<dyn Query>> {
        if values.is_empty() {
            return Ok(Box::new(EmptyQuery));
        }
        let clauses = values
            .iter()
            .map(|value| (Occur::Should, self.exact(field, value)))
            .collect();
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn compile_bool(&self, query: &BoolQuery) -> SearchResult<Box<dyn Query>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for clause in &query.must {
            clauses.push((Occur::Must, self.compile(clause)?));
        }
        for clause in &query.filter {
            let inner = self.compile(clause)?;
            clauses.push((Occur::Must, Box::new(ConstScoreQuery::new(inner, 0.0))));
        }
        let scoring_or_filter = !clauses.is_empty();
        for clause in &query.should {
            clauses.push((Occur::Should, self.compile(clause)?));
        }
        if !scoring_or_filter && query.should.is_empty() {
            // Only exclusions (or nothing at all): start from every document
            clauses.push((Occur::Must, Box::new(AllQuery)));
        }
        for clause in &query.must_not {
            clauses.push((Occur::MustNot, self.compile(clause)?));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn search(&self, query: &dyn Query, limit: usize) -> SearchResult<Vec<(f32, Document)>> {
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let source = doc
                .get_first(self.source)
                .and_then(|v| v.as_str())
                .ok_or_else(|| SearchError::Query("stored document is missing".to_string()))?;
            let document: Document = serde_json::from_str(source)?;
            hits.push((score, document));
        }
        Ok(hits)
    }
}

#[derive(Default)]
struct PhysicalIndex {
    segments: Vec<Arc<Segment>>,
}

#[derive(Default)]
struct State {
    indices: HashMap<String, PhysicalIndex>,
    /// alias -> bound indices
    aliases: HashMap<String, BTreeSet<String>>,
}

impl State {
    fn resolve(&self, target: &IndexTarget) -> BTreeSet<String> {
        match target {
            IndexTarget::Aliases(names) => names
                .iter()
                .flat_map(|name| match self.aliases.get(name) {
                    Some(bound) => bound.iter().cloned().collect::<Vec<_>>(),
                    None if self.indices.contains_key(name) => vec![name.clone()],
                    None => Vec::new(),
                })
                .collect(),
            IndexTarget::Pattern(pattern) => self
                .aliases
                .iter()
                .filter(|(alias, _)| wildcard_match(pattern, alias))
                .flat_map(|(_, bound)| bound.iter().cloned())
                .collect(),
        }
    }
}

/// In-memory search backend.
///
/// Index and alias tables live under a single lock, so an alias update is
/// observed by searches either entirely or not at all.
pub struct MemoryBackend {
    state: RwLock<State>,
    writer_heap_size: usize,
}

impl MemoryBackend {
    pub fn new(writer_heap_size: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            writer_heap_size: writer_heap_size.max(MIN_WRITER_HEAP_SIZE),
        }
    }

    /// Names of all physical indices, sorted
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().indices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of documents held by an index
    pub fn document_count(&self, index: &str) -> Option<u64> {
        self.state.read().indices.get(index).map(|idx| {
            idx.segments
                .iter()
                .map(|s| s.reader.searcher().num_docs())
                .sum()
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(50_000_000)
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_index(&self, index: &str) -> SearchResult<()> {
        let mut state = self.state.write();
        if state.indices.contains_key(index) || state.aliases.contains_key(index) {
            return Err(SearchError::Backend {
                status: 400,
                message: format!("resource_already_exists_exception: index [{}]", index),
            });
        }
        state.indices.insert(index.to_string(), PhysicalIndex::default());
        tracing::debug!(index, "Memory index created");
        Ok(())
    }

    async fn bulk_load(
        &self,
        index: &str,
        documents: &[Document],
    ) -> SearchResult<Vec<BulkItemOutcome>> {
        if !self.state.read().indices.contains_key(index) {
            return Err(SearchError::Backend {
                status: 404,
                message: format!("index_not_found_exception: no such index [{}]", index),
            });
        }

        let mut outcomes = Vec::with_capacity(documents.len());
        let mut accepted = Vec::with_capacity(documents.len());
        for document in documents {
            if document.field_names().any(|name| name.trim().is_empty()) {
                outcomes.push(BulkItemOutcome::Failed {
                    status: 400,
                    reason: "mapper_parsing_exception: field name cannot be empty".to_string(),
                });
            } else {
                outcomes.push(BulkItemOutcome::Indexed);
                accepted.push(document.clone());
            }
        }

        if accepted.is_empty() {
            return Ok(outcomes);
        }

        let heap = self.writer_heap_size;
        let segment = tokio::task::spawn_blocking(move || Segment::build(&accepted, heap))
            .await
            .map_err(|e| SearchError::Tantivy(format!("indexing task failed: {}", e)))??;

        let mut state = self.state.write();
        let physical = state.indices.get_mut(index).ok_or_else(|| SearchError::Backend {
            status: 404,
            message: format!("index_not_found_exception: index [{}] was deleted", index),
        })?;
        physical.segments.push(Arc::new(segment));
        Ok(outcomes)
    }

    async fn list_aliases(&self, alias: &str) -> SearchResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .aliases
            .get(alias)
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_indices(&self, pattern: &str) -> SearchResult<Vec<String>> {
        let mut names: Vec<String> = self
            .state
            .read()
            .indices
            .keys()
            .filter(|name| wildcard_match(pattern, name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()> {
        let mut state = self.state.write();

        // Validate everything first so the update applies fully or not at all
        for action in actions {
            if let AliasAction::Add { index, alias } = action {
                if !state.indices.contains_key(index) {
                    return Err(SearchError::Backend {
                        status: 404,
                        message: format!("index_not_found_exception: no such index [{}]", index),
                    });
                }
                if state.indices.contains_key(alias) {
                    return Err(SearchError::Backend {
                        status: 400,
                        message: format!("invalid_alias_name_exception: [{}] is an index", alias),
                    });
                }
            }
        }

        for action in actions {
            match action {
                AliasAction::Remove {
                    index_pattern,
                    alias,
                } => {
                    if let Some(bound) = state.aliases.get_mut(alias) {
                        bound.retain(|index| !wildcard_match(index_pattern, index));
                        if bound.is_empty() {
                            state.aliases.remove(alias);
                        }
                    }
                }
                AliasAction::Add { index, alias } => {
                    state
                        .aliases
                        .entry(alias.clone())
                        .or_default()
                        .insert(index.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete_indices(&self, indices: &[String]) -> SearchResult<()> {
        let mut state = self.state.write();
        for index in indices {
            state.indices.remove(index);
        }
        state.aliases.retain(|_, bound| {
            bound.retain(|index| !indices.contains(index));
            !bound.is_empty()
        });
        Ok(())
    }

    async fn search(
        &self,
        target: &IndexTarget,
        query: &TranslatedQuery,
    ) -> SearchResult<Vec<RawHit>> {
        // Snapshot segments under the lock; searching happens outside it
        let segments: Vec<(String, Arc<Segment>)> = {
            let state = self.state.read();
            state
                .resolve(target)
                .into_iter()
                .filter_map(|name| state.indices.get(&name).map(|idx| (name, idx)))
                .flat_map(|(name, idx)| {
                    idx.segments
                        .iter()
                        .map(move |segment| (name.clone(), Arc::clone(segment)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let limit = query.size.unwrap_or(DEFAULT_HITS);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut hits = Vec::new();
        for (index, segment) in segments {
            let compiled = segment.compile(&query.query)?;
            for (score, source) in segment.search(compiled.as_ref(), limit)? {
                hits.push(RawHit {
                    index: index.clone(),
                    source,
                    score: Some(score),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .unwrap_or_default()
                .total_cmp(&a.score.unwrap_or_default())
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::query::Fuzziness;
    use serde_json::json;

    fn doc(title: &str, owner: &str) -> Document {
        Document::new()
            .with_field("title", title)
            .with_field("owner", owner)
    }

    fn multi_match(term: &str) -> TranslatedQuery {
        TranslatedQuery::new(QueryDsl::fuzzy_multi_match(term, vec![]), None).with_size(10)
    }

    async fn backend_with(index: &str, alias: &str, docs: &[Document]) -> MemoryBackend {
        let backend = MemoryBackend::default();
        backend.create_index(index).await.unwrap();
        backend.bulk_load(index, docs).await.unwrap();
        backend
            .update_aliases(&[AliasAction::Add {
                index: index.to_string(),
                alias: alias.to_string(),
            }])
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_create_index_twice_fails() {
        let backend = MemoryBackend::default();
        backend.create_index("component__1").await.unwrap();
        let err = backend.create_index("component__1").await.unwrap_err();
        assert!(matches!(err, SearchError::Backend { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_bulk_load_into_missing_index() {
        let backend = MemoryBackend::default();
        let err = backend
            .bulk_load("missing__1", &[doc("a", "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Backend { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_bulk_load_rejects_empty_field_names() {
        let backend = MemoryBackend::default();
        backend.create_index("component__1").await.unwrap();
        let bad = Document::new().with_field("", "nameless");
        let outcomes = backend
            .bulk_load("component__1", &[doc("payments", "team-a"), bad])
            .await
            .unwrap();

        assert_eq!(outcomes[0], BulkItemOutcome::Indexed);
        assert!(matches!(outcomes[1], BulkItemOutcome::Failed { status: 400, .. }));
        assert_eq!(backend.document_count("component__1"), Some(1));
    }

    #[tokio::test]
    async fn test_fuzzy_search_through_alias() {
        let backend = backend_with(
            "component__1",
            "component__search",
            &[doc("payments service", "team-a"), doc("checkout", "team-b")],
        )
        .await;

        // one typo in "payments"
        let hits = backend
            .search(
                &IndexTarget::Aliases(vec!["component__search".into()]),
                &multi_match("paymants"),
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, "component__1");
        assert_eq!(hits[0].source, doc("payments service", "team-a"));
    }

    #[tokio::test]
    async fn test_unbound_indices_are_invisible_to_pattern_search() {
        let backend = backend_with("component__1", "component__search", &[doc("alpha", "x")]).await;
        backend.create_index("component__2").await.unwrap();
        backend
            .bulk_load("component__2", &[doc("alpha beta", "y")])
            .await
            .unwrap();

        let hits = backend
            .search(&IndexTarget::Pattern("*__search".into()), &multi_match("alpha"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, "component__1");
    }

    #[tokio::test]
    async fn test_unknown_alias_contributes_nothing() {
        let backend = backend_with("component__1", "component__search", &[doc("alpha", "x")]).await;
        let hits = backend
            .search(
                &IndexTarget::Aliases(vec!["unknown__search".into()]),
                &multi_match("alpha"),
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_alias_swap_is_atomic_replace() {
        let backend = backend_with("component__1", "component__search", &[doc("old", "x")]).await;
        backend.create_index("component__2").await.unwrap();
        backend.bulk_load("component__2", &[doc("new", "y")]).await.unwrap();

        backend
            .update_aliases(&[
                AliasAction::Remove {
                    index_pattern: "component__*".into(),
                    alias: "component__search".into(),
                },
                AliasAction::Add {
                    index: "component__2".into(),
                    alias: "component__search".into(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            backend.list_aliases("component__search").await.unwrap(),
            vec!["component__2"]
        );
    }

    #[tokio::test]
    async fn test_alias_update_with_missing_index_changes_nothing() {
        let backend = backend_with("component__1", "component__search", &[doc("old", "x")]).await;
        let result = backend
            .update_aliases(&[
                AliasAction::Remove {
                    index_pattern: "component__*".into(),
                    alias: "component__search".into(),
                },
                AliasAction::Add {
                    index: "component__404".into(),
                    alias: "component__search".into(),
                },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(
            backend.list_aliases("component__search").await.unwrap(),
            vec!["component__1"]
        );
    }

    #[tokio::test]
    async fn test_delete_indices_drops_bindings() {
        let backend = backend_with("component__1", "component__search", &[doc("old", "x")]).await;
        backend
            .delete_indices(&["component__1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(backend.index_names().is_empty());
        assert!(backend.list_aliases("component__search").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_indices_by_pattern() {
        let backend = MemoryBackend::default();
        for name in ["component__1", "component__2", "techdocs__1"] {
            backend.create_index(name).await.unwrap();
        }
        assert_eq!(
            backend.list_indices("component__*").await.unwrap(),
            vec!["component__1", "component__2"]
        );
    }

    #[tokio::test]
    async fn test_term_filters_and_bool() {
        let backend = backend_with(
            "component__1",
            "component__search",
            &[
                doc("payments api", "team-a"),
                doc("payments ui", "team-b"),
                doc("search", "team-a"),
            ],
        )
        .await;
        let target = IndexTarget::Aliases(vec!["component__search".into()]);

        let filtered = TranslatedQuery::new(
            QueryDsl::Bool(BoolQuery {
                must: vec![QueryDsl::fuzzy_multi_match("payments", vec!["title".into()])],
                filter: vec![QueryDsl::Term {
                    field: "owner".into(),
                    value: json!("team-a"),
                }],
                ..Default::default()
            }),
            None,
        );
        let hits = backend.search(&target, &filtered).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, doc("payments api", "team-a"));

        let excluded = TranslatedQuery::new(
            QueryDsl::Bool(BoolQuery {
                must_not: vec![QueryDsl::Terms {
                    field: "owner".into(),
                    values: vec![json!("team-a")],
                }],
                ..Default::default()
            }),
            None,
        );
        let hits = backend.search(&target, &excluded).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, doc("payments ui", "team-b"));
    }

    #[tokio::test]
    async fn test_multi_match_respects_field_scope() {
        let backend = backend_with(
            "component__1",
            "component__search",
            &[doc("payments", "checkout-team")],
        )
        .await;
        let target = IndexTarget::Aliases(vec!["component__search".into()]);
        let query = TranslatedQuery::new(
            QueryDsl::MultiMatch {
                query: "checkout".into(),
                fields: vec!["title".into()],
                fuzziness: Fuzziness::Fixed(0),
                minimum_should_match: 1,
            },
            None,
        );
        assert!(backend.search(&target, &query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hits_merge_across_batches_and_limit() {
        let backend = MemoryBackend::default();
        backend.create_index("build__1").await.unwrap();
        backend
            .bulk_load("build__1", &[doc("deploy one", "ci"), doc("deploy two", "ci")])
            .await
            .unwrap();
        backend
            .bulk_load("build__1", &[doc("deploy three", "ci")])
            .await
            .unwrap();
        backend
            .update_aliases(&[AliasAction::Add {
                index: "build__1".into(),
                alias: "build__search".into(),
            }])
            .await
            .unwrap();

        let target = IndexTarget::Aliases(vec!["build__search".into()]);
        let all = backend.search(&target, &multi_match("deploy")).await.unwrap();
        assert_eq!(all.len(), 3);

        let limited = TranslatedQuery::new(QueryDsl::MatchAll, None).with_size(2);
        assert_eq!(backend.search(&target, &limited).await.unwrap().len(), 2);
    }
}
