//! Per-type field registry used to scope default query matching

use crate::search::document::Document;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// Field names known for one document type
pub type DocumentTypeSchema = BTreeSet<String>;

/// Tracks the searchable field set of every indexed document type.
///
/// The schema of a type is the union of field names across the documents of
/// its most recent successful indexing call; it replaces whatever was known
/// before, so fields dropped by producers stop being searched.
#[derive(Debug, Default)]
pub struct DocumentTypeRegistry {
    schemas: RwLock<HashMap<String, DocumentTypeSchema>>,
}

impl DocumentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the field shape of a freshly indexed batch
    pub fn record<'a, I>(&self, doc_type: &str, documents: I)
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let schema: DocumentTypeSchema = documents
            .into_iter()
            .flat_map(|doc| doc.field_names().map(str::to_string))
            .collect();

        tracing::debug!(doc_type, fields = schema.len(), "Document type schema updated");
        self.schemas.write().insert(doc_type.to_string(), schema);
    }

    /// Schema of a single type
    pub fn schema(&self, doc_type: &str) -> Option<DocumentTypeSchema> {
        self.schemas.read().get(doc_type).cloned()
    }

    /// Whether the type has been indexed at least once
    pub fn contains(&self, doc_type: &str) -> bool {
        self.schemas.read().contains_key(doc_type)
    }

    /// Known types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Union of the fields of the given types, or of every known type when
    /// `types` is `None` or empty. Unknown types contribute nothing.
    pub fn searchable_fields(&self, types: Option<&[String]>) -> Vec<String> {
        let schemas = self.schemas.read();
        let fields: BTreeSet<&String> = match types {
            Some(types) if !types.is_empty() => types
                .iter()
                .filter_map(|t| schemas.get(t))
                .flatten()
                .collect(),
            _ => schemas.values().flatten().collect(),
        };
        fields.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(fields: &[&str]) -> Document {
        fields.iter().map(|f| (*f, "value")).collect()
    }

    #[test]
    fn test_schema_is_union_of_batch() {
        let registry = DocumentTypeRegistry::new();
        registry.record("component", &[doc(&["title", "text"]), doc(&["title", "owner"])]);

        let schema = registry.schema("component").unwrap();
        assert_eq!(
            schema.into_iter().collect::<Vec<_>>(),
            vec!["owner", "text", "title"]
        );
    }

    #[test]
    fn test_reindex_replaces_schema() {
        let registry = DocumentTypeRegistry::new();
        registry.record("component", &[doc(&["title", "legacy"])]);
        registry.record("component", &[doc(&["title"])]);

        assert_eq!(registry.searchable_fields(None), vec!["title"]);
    }

    #[test]
    fn test_searchable_fields_scoped_by_type() {
        let registry = DocumentTypeRegistry::new();
        registry.record("component", &[doc(&["title", "owner"])]);
        registry.record("techdocs", &[doc(&["title", "path"])]);

        let scoped = registry.searchable_fields(Some(&["techdocs".to_string()]));
        assert_eq!(scoped, vec!["path", "title"]);

        let all = registry.searchable_fields(None);
        assert_eq!(all, vec!["owner", "path", "title"]);

        let unknown = registry.searchable_fields(Some(&["unknown".to_string()]));
        assert!(unknown.is_empty());
    }
}
