//! Common test utilities for search engine testing
//!
//! [`ScriptedBackend`] wraps the in-memory backend and lets a test inject
//! failures and delays at the points the reindex protocol depends on.

#![allow(dead_code)]

use async_trait::async_trait;
use docsearch::search::{
    AliasAction, BackendClient, BulkItemOutcome, Document, IndexTarget, MemoryBackend, RawHit,
    SearchConfig, SearchConfigBuilder, SearchError, SearchResult, TranslatedQuery,
};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Documents carrying this field are rejected by [`ScriptedBackend`]
pub const REJECT_FIELD: &str = "reject";

#[derive(Default)]
pub struct ScriptedBackend {
    inner: MemoryBackend,
    alias_delay_ms: AtomicU64,
    search_delay_ms: AtomicU64,
    bulk_delay_ms: AtomicU64,
    alias_failures: AtomicU32,
    alias_lost_responses: AtomicU32,
    bulk_failures: AtomicU32,
    busy_responses: AtomicU32,
    delete_failures: AtomicU32,
    alias_updates: AtomicUsize,
    bulk_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Delay every alias update
    pub fn delay_alias_updates(&self, delay: Duration) {
        self.alias_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every search
    pub fn delay_searches(&self, delay: Duration) {
        self.search_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every bulk request
    pub fn delay_bulk_loads(&self, delay: Duration) {
        self.bulk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `n` index deletions without applying them
    pub fn fail_deletes(&self, n: u32) {
        self.delete_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` alias updates without applying them
    pub fn fail_alias_updates(&self, n: u32) {
        self.alias_failures.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` alias updates but report an error
    pub fn lose_alias_responses(&self, n: u32) {
        self.alias_lost_responses.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` bulk requests with a connection error
    pub fn fail_bulk_requests(&self, n: u32) {
        self.bulk_failures.store(n, Ordering::SeqCst);
    }

    /// Answer every item of the next `n` bulk requests with 429
    pub fn reject_as_busy(&self, n: u32) {
        self.busy_responses.store(n, Ordering::SeqCst);
    }

    pub fn alias_updates(&self) -> usize {
        self.alias_updates.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Physical indices holding generations of `doc_type`
    pub fn generations_of(&self, doc_type: &str) -> Vec<String> {
        let prefix = format!("{}__", doc_type);
        self.inner
            .index_names()
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect()
    }
}

/// Consume one unit of a scripted budget
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_index(&self, index: &str) -> SearchResult<()> {
        self.inner.create_index(index).await
    }

    async fn bulk_load(
        &self,
        index: &str,
        documents: &[Document],
    ) -> SearchResult<Vec<BulkItemOutcome>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.bulk_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if take(&self.bulk_failures) {
            return Err(SearchError::Connection("scripted connection reset".to_string()));
        }
        if take(&self.busy_responses) {
            return Ok(documents
                .iter()
                .map(|_| BulkItemOutcome::Failed {
                    status: 429,
                    reason: "es_rejected_execution_exception".to_string(),
                })
                .collect());
        }

        let accepted: Vec<Document> = documents
            .iter()
            .filter(|d| d.get(REJECT_FIELD).is_none())
            .cloned()
            .collect();
        let mut loaded = self.inner.bulk_load(index, &accepted).await?.into_iter();

        Ok(documents
            .iter()
            .map(|d| {
                if d.get(REJECT_FIELD).is_some() {
                    BulkItemOutcome::Failed {
                        status: 400,
                        reason: "mapper_parsing_exception: scripted rejection".to_string(),
                    }
                } else {
                    loaded.next().unwrap_or(BulkItemOutcome::Failed {
                        status: 500,
                        reason: "missing outcome".to_string(),
                    })
                }
            })
            .collect())
    }

    async fn list_aliases(&self, alias: &str) -> SearchResult<Vec<String>> {
        self.inner.list_aliases(alias).await
    }

    async fn list_indices(&self, pattern: &str) -> SearchResult<Vec<String>> {
        self.inner.list_indices(pattern).await
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()> {
        self.alias_updates.fetch_add(1, Ordering::SeqCst);

        let delay = self.alias_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if take(&self.alias_failures) {
            return Err(SearchError::Backend {
                status: 503,
                message: "scripted alias failure".to_string(),
            });
        }
        if take(&self.alias_lost_responses) {
            self.inner.update_aliases(actions).await?;
            return Err(SearchError::Connection("scripted lost response".to_string()));
        }
        self.inner.update_aliases(actions).await
    }

    async fn delete_indices(&self, indices: &[String]) -> SearchResult<()> {
        if take(&self.delete_failures) {
            return Err(SearchError::Backend {
                status: 503,
                message: "scripted delete failure".to_string(),
            });
        }
        self.inner.delete_indices(indices).await
    }

    async fn search(
        &self,
        target: &IndexTarget,
        query: &TranslatedQuery,
    ) -> SearchResult<Vec<RawHit>> {
        let delay = self.search_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.search(target, query).await
    }
}

/// Engine settings with fast retries
pub fn test_config() -> SearchConfigBuilder {
    SearchConfigBuilder::new()
        .retry_backoff_ms(1)
        .bulk_batch_size(2)
}

pub fn default_config() -> SearchConfig {
    test_config().build()
}

/// A catalog component document
pub fn component(name: &str, owner: &str) -> Document {
    Document::new()
        .with_field("name", name)
        .with_field("owner", owner)
}

/// Documents are compared as sets: hits arrive in score order
pub fn sorted(mut documents: Vec<Document>) -> Vec<String> {
    let mut keys: Vec<String> = documents
        .drain(..)
        .map(|d| d.to_json().to_string())
        .collect();
    keys.sort();
    keys
}
