//! Query translation strategies

use crate::search::error::{SearchError, SearchResult};
use crate::search::query::{BoolQuery, QueryDsl, SearchQuery, TranslatedQuery};
use crate::search::registry::DocumentTypeRegistry;

/// Converts an abstract [`SearchQuery`] into a query the engine executes.
///
/// Translators are installed on an engine with `set_translator` and are
/// shared across concurrent queries, so they must be `Send + Sync`.
pub trait QueryTranslator: Send + Sync {
    /// Translate `query`. `registry` exposes the known field set per type.
    fn translate(
        &self,
        query: &SearchQuery,
        registry: &DocumentTypeRegistry,
    ) -> SearchResult<TranslatedQuery>;
}

impl<F> QueryTranslator for F
where
    F: Fn(&SearchQuery, &DocumentTypeRegistry) -> SearchResult<TranslatedQuery> + Send + Sync,
{
    fn translate(
        &self,
        query: &SearchQuery,
        registry: &DocumentTypeRegistry,
    ) -> SearchResult<TranslatedQuery> {
        self(query, registry)
    }
}

/// Fuzzy multi-field match across the searchable fields of the requested
/// types. Filters are not applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTranslator;

impl QueryTranslator for DefaultTranslator {
    fn translate(
        &self,
        query: &SearchQuery,
        registry: &DocumentTypeRegistry,
    ) -> SearchResult<TranslatedQuery> {
        let types = query.requested_types();
        let fields = registry.searchable_fields(types);

        let dsl = if query.term.trim().is_empty() {
            QueryDsl::MatchAll
        } else {
            QueryDsl::fuzzy_multi_match(query.term.trim(), fields)
        };

        Ok(TranslatedQuery::new(dsl, types.map(<[String]>::to_vec)))
    }
}

/// Default fuzzy match narrowed by exact-value filters built from
/// [`SearchQuery::filters`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FilteringTranslator;

impl QueryTranslator for FilteringTranslator {
    fn translate(
        &self,
        query: &SearchQuery,
        registry: &DocumentTypeRegistry,
    ) -> SearchResult<TranslatedQuery> {
        let mut translated = DefaultTranslator.translate(query, registry)?;
        if query.filters.is_empty() {
            return Ok(translated);
        }

        let filter = filter_clauses(query)?;
        translated.query = QueryDsl::Bool(BoolQuery {
            must: vec![translated.query],
            filter,
            ..Default::default()
        });
        Ok(translated)
    }
}

/// Exact-match clauses for every filter of the query
pub fn filter_clauses(query: &SearchQuery) -> SearchResult<Vec<QueryDsl>> {
    query
        .filters
        .iter()
        .map(|(field, value)| {
            if field.is_empty() {
                return Err(SearchError::Query("filter with empty field name".to_string()));
            }
            let values: Vec<_> = value.values().into_iter().cloned().collect();
            Ok(match values.len() {
                0 => QueryDsl::MatchNone,
                1 => QueryDsl::Term {
                    field: field.clone(),
                    value: values.into_iter().next().unwrap_or_default(),
                },
                _ => QueryDsl::Terms {
                    field: field.clone(),
                    values,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::document::Document;
    use crate::search::query::Fuzziness;
    use serde_json::json;

    fn registry() -> DocumentTypeRegistry {
        let registry = DocumentTypeRegistry::new();
        registry.record(
            "component",
            &[Document::new().with_field("title", "a").with_field("owner", "b")],
        );
        registry.record(
            "techdocs",
            &[Document::new().with_field("title", "a").with_field("text", "b")],
        );
        registry
    }

    #[test]
    fn test_default_translator_uses_all_fields() {
        let translated = DefaultTranslator
            .translate(&SearchQuery::new("payments"), &registry())
            .unwrap();

        assert_eq!(translated.document_types, None);
        assert_eq!(
            translated.query,
            QueryDsl::MultiMatch {
                query: "payments".to_string(),
                fields: vec!["owner".into(), "text".into(), "title".into()],
                fuzziness: Fuzziness::Auto,
                minimum_should_match: 1,
            }
        );
    }

    #[test]
    fn test_default_translator_scopes_fields_by_type() {
        let query = SearchQuery::new("intro").with_types(vec!["techdocs"]);
        let translated = DefaultTranslator.translate(&query, &registry()).unwrap();

        assert_eq!(translated.document_types, Some(vec!["techdocs".to_string()]));
        match translated.query {
            QueryDsl::MultiMatch { fields, .. } => assert_eq!(fields, vec!["text", "title"]),
            other => panic!("unexpected query {:?}", other),
        }
    }

    #[test]
    fn test_default_translator_ignores_filters() {
        let query = SearchQuery::new("intro").with_filter("owner", "team-a");
        let translated = DefaultTranslator.translate(&query, &registry()).unwrap();
        assert!(matches!(translated.query, QueryDsl::MultiMatch { .. }));
    }

    #[test]
    fn test_blank_term_matches_all() {
        let translated = DefaultTranslator
            .translate(&SearchQuery::new("  "), &registry())
            .unwrap();
        assert_eq!(translated.query, QueryDsl::MatchAll);
    }

    #[test]
    fn test_filtering_translator_adds_term_filters() {
        let query = SearchQuery::new("payments")
            .with_filter("owner", "team-a")
            .with_filter("lifecycle", vec!["production", "beta"]);
        let translated = FilteringTranslator.translate(&query, &registry()).unwrap();

        let QueryDsl::Bool(bool_query) = translated.query else {
            panic!("expected bool query");
        };
        assert_eq!(bool_query.must.len(), 1);
        assert_eq!(
            bool_query.filter,
            vec![
                QueryDsl::Terms {
                    field: "lifecycle".into(),
                    values: vec![json!("production"), json!("beta")],
                },
                QueryDsl::Term {
                    field: "owner".into(),
                    value: json!("team-a"),
                },
            ]
        );
    }

    #[test]
    fn test_closure_translator() {
        let translator = |query: &SearchQuery,
                          _: &DocumentTypeRegistry|
         -> SearchResult<TranslatedQuery> {
            Ok(TranslatedQuery::new(
                QueryDsl::Term {
                    field: "title".into(),
                    value: json!(query.term),
                },
                None,
            ))
        };
        let translated = translator
            .translate(&SearchQuery::new("exact"), &registry())
            .unwrap();
        assert_eq!(
            translated.query,
            QueryDsl::Term {
                field: "title".into(),
                value: json!("exact")
            }
        );
    }
}
