//! Error types for search operations

use crate::error::AppError;
use crate::search::document::DocumentFailure;
use serde::Serialize;
use std::fmt;

/// Result type for search operations
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Per-document failures collected while bulk loading a generation
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexingError {
    /// Document type the failures belong to
    pub doc_type: String,

    /// Failed documents with their causes, in input order
    pub failures: Vec<DocumentFailure>,
}

impl IndexingError {
    pub fn new(doc_type: impl Into<String>, failures: Vec<DocumentFailure>) -> Self {
        Self {
            doc_type: doc_type.into(),
            failures,
        }
    }

    /// Number of documents that failed
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for IndexingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} document(s) of type '{}' failed to index",
            self.failures.len(),
            self.doc_type
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, " (first: #{} {})", first.position, first.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for IndexingError {}

/// Errors that can occur during search operations
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Missing or invalid backend configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Transport or authentication failure reaching the backend
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Backend answered with an error status
    #[error("Backend error (status {status}): {message}")]
    Backend { status: u16, message: String },

    /// The new generation could not be built
    #[error("Indexing failed: {0}")]
    Indexing(IndexingError),

    /// A reindex of the same type is already running
    #[error("Reindex already in progress for type '{doc_type}'")]
    ReindexInProgress { doc_type: String },

    /// Alias rebind failed or was left partially applied
    #[error("Alias swap failed for '{alias}': {message}")]
    AliasSwap { alias: String, message: String },

    /// Malformed translated query or backend search failure
    #[error("Query failed: {0}")]
    Query(String),

    /// Operation exceeded its time budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// index() was called without documents
    #[error("No documents supplied for type '{doc_type}'")]
    EmptyDocumentSet { doc_type: String },

    /// Type name cannot be used to form index or alias names
    #[error("Invalid document type: {0}")]
    InvalidDocumentType(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tantivy error
    #[error("Tantivy error: {0}")]
    Tantivy(String),
}

impl SearchError {
    /// Whether the failure is transient and may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Connection(_) | SearchError::Timeout(_) => true,
            SearchError::Backend { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }
}

impl From<tantivy::TantivyError> for SearchError {
    fn from(err: tantivy::TantivyError) -> Self {
        SearchError::Tantivy(err.to_string())
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        SearchError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SearchError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            SearchError::Connection(err.to_string())
        } else if err.is_decode() {
            SearchError::Serialization(err.to_string())
        } else {
            SearchError::Backend {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: err.to_string(),
            }
        }
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Configuration(msg) => AppError::Configuration(msg),
            SearchError::Connection(msg) => AppError::Network(msg),
            SearchError::Timeout(msg) => AppError::Timeout(msg),
            SearchError::Serialization(msg) => AppError::Serialization(msg),
            SearchError::EmptyDocumentSet { .. } | SearchError::InvalidDocumentType(_) => {
                AppError::Validation(err.to_string())
            }
            _ => AppError::Search(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SearchError::Backend {
            status: 429,
            message: "es_rejected_execution_exception".to_string()
        }
        .is_retryable());
        assert!(SearchError::Connection("refused".to_string()).is_retryable());
        assert!(!SearchError::Backend {
            status: 400,
            message: "mapper_parsing_exception".to_string()
        }
        .is_retryable());
        assert!(!SearchError::Configuration("missing node".to_string()).is_retryable());
    }

    #[test]
    fn test_indexing_error_names_first_failure() {
        let err = IndexingError::new(
            "component",
            vec![DocumentFailure::new(
                2,
                serde_json::Map::new().into(),
                400,
                "mapper_parsing_exception",
            )],
        );
        let message = err.to_string();
        assert!(message.contains("1 document(s) of type 'component'"));
        assert!(message.contains("#2"));
    }
}
