//! Generation management and the reindex protocol
//!
//! Every reindex of a type builds a fresh physical index (a *generation*),
//! atomically rebinds the type's alias to it and then prunes the generations
//! it replaced:
//!
//! ```text
//! Idle ──▶ Building ──▶ Swapping ──▶ Pruning ──▶ Idle
//!             │             │
//!             ▼             ▼
//!      discard new    restore previous
//!      generation     binding, discard
//! ```
//!
//! Readers only ever resolve a type through its alias, so they see the
//! previous generation in full until the swap and the new one in full after.

use crate::search::backend::{AliasAction, BackendClient, BulkItemOutcome};
use crate::search::config::{ReindexPolicy, SearchConfig};
use crate::search::document::{Document, DocumentFailure};
use crate::search::error::{IndexingError, SearchError, SearchResult};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Separates the type from the generation or alias postfix
pub const NAME_SEPARATOR: &str = "__";

/// Where a type's reindex currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReindexState {
    #[default]
    Idle,
    Building,
    Swapping,
    Pruning,
}

/// Name of a physical generation index: `<type>__<generation>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexName {
    pub doc_type: String,
    pub generation: u64,
}

impl IndexName {
    pub fn new(doc_type: impl Into<String>, generation: u64) -> Self {
        Self {
            doc_type: doc_type.into(),
            generation,
        }
    }

    /// Parse a physical index name. Aliases and foreign indices yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let (doc_type, generation) = name.rsplit_once(NAME_SEPARATOR)?;
        if doc_type.is_empty() || generation.is_empty() {
            return None;
        }
        if !generation.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self::new(doc_type, generation.parse().ok()?))
    }

    /// Wildcard matching every generation of `doc_type`
    pub fn pattern(doc_type: &str) -> String {
        format!("{}{}*", doc_type, NAME_SEPARATOR)
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.doc_type, NAME_SEPARATOR, self.generation)
    }
}

/// Alias readers use for `doc_type`
pub fn alias_name(doc_type: &str, postfix: &str) -> String {
    format!("{}{}{}", doc_type, NAME_SEPARATOR, postfix)
}

/// Identifies one generation of a type and the alias it is promoted under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub doc_type: String,
    pub generation: u64,
    pub alias: String,
}

impl IndexDescriptor {
    pub fn index_name(&self) -> String {
        IndexName::new(&self.doc_type, self.generation).to_string()
    }
}

/// Hands out strictly increasing generation ids based on wall-clock millis
#[derive(Debug, Default)]
pub struct GenerationClock {
    last: AtomicU64,
}

impl GenerationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next generation id, greater than every id issued or observed so far
    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a generation that already exists in the store
    pub fn observe(&self, generation: u64) {
        self.last.fetch_max(generation, Ordering::SeqCst);
    }
}

/// Outcome of a completed reindex
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    /// The generation now current
    pub descriptor: IndexDescriptor,

    /// Documents accepted into the new generation
    pub indexed: usize,

    /// Documents excluded from the new generation
    pub failures: Option<IndexingError>,

    /// Stale generations deleted
    pub pruned: Vec<String>,

    /// Stale generations that could not be deleted; retried on the next reindex
    pub prune_failures: Vec<String>,
}

impl IndexReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_none()
    }

    /// Turn per-document failures into an error
    pub fn into_result(self) -> SearchResult<Self> {
        match self.failures {
            Some(failures) => Err(SearchError::Indexing(failures)),
            None => Ok(self),
        }
    }
}

/// Reject type names that cannot form a valid index and alias name
pub fn validate_document_type(doc_type: &str) -> SearchResult<()> {
    let invalid = |reason: &str| -> SearchResult<()> {
        Err(SearchError::InvalidDocumentType(format!(
            "'{}' {}",
            doc_type, reason
        )))
    };

    if doc_type.is_empty() {
        return invalid("is empty");
    }
    if doc_type.contains(NAME_SEPARATOR) {
        return invalid("must not contain '__'");
    }
    if doc_type.starts_with(['_', '-', '+', '.']) {
        return invalid("must not start with '_', '-', '+' or '.'");
    }
    if doc_type.chars().any(|c| c.is_uppercase()) {
        return invalid("must be lowercase");
    }
    if let Some(c) = doc_type
        .chars()
        .find(|c| c.is_whitespace() || "*,/\\?\"<>|#:".contains(*c))
    {
        return invalid(&format!("contains invalid character '{}'", c));
    }
    Ok(())
}

/// Clears the published state of a type when its reindex ends or is dropped
struct StateGuard<'a> {
    states: &'a DashMap<String, ReindexState>,
    doc_type: &'a str,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.states.remove(self.doc_type);
    }
}

/// Runs the reindex protocol against a backend
pub struct IndexManager<B> {
    backend: Arc<B>,
    config: SearchConfig,
    clock: GenerationClock,
    /// Single-flight lock per type
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, ReindexState>,
}

impl<B: BackendClient> IndexManager<B> {
    pub fn new(backend: Arc<B>, config: SearchConfig) -> Self {
        Self {
            backend,
            config,
            clock: GenerationClock::new(),
            locks: DashMap::new(),
            states: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Alias of `doc_type`
    pub fn alias_for(&self, doc_type: &str) -> String {
        alias_name(doc_type, &self.config.alias_postfix)
    }

    /// Current protocol state of `doc_type`
    pub fn state(&self, doc_type: &str) -> ReindexState {
        self.states
            .get(doc_type)
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Generation the alias of `doc_type` resolves to, if any
    pub async fn current_generation(&self, doc_type: &str) -> SearchResult<Option<u64>> {
        let bound = self.backend.list_aliases(&self.alias_for(doc_type)).await?;
        Ok(bound
            .iter()
            .filter_map(|name| IndexName::parse(name))
            .filter(|name| name.doc_type == doc_type)
            .map(|name| name.generation)
            .max())
    }

    /// Replace the documents of `doc_type` with `documents`.
    ///
    /// Per-document failures do not abort the run: they are returned in
    /// [`IndexReport::failures`] as long as at least one document made it
    /// into the new generation.
    pub async fn reindex(
        &self,
        doc_type: &str,
        documents: &[Document],
    ) -> SearchResult<IndexReport> {
        validate_document_type(doc_type)?;
        if documents.is_empty() {
            return Err(SearchError::EmptyDocumentSet {
                doc_type: doc_type.to_string(),
            });
        }

        let lock = self
            .locks
            .entry(doc_type.to_string())
            .or_default()
            .clone();
        let _guard = match self.config.reindex_policy {
            ReindexPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                warn!(doc_type = %doc_type, "Reindex rejected, another one is running");
                SearchError::ReindexInProgress {
                    doc_type: doc_type.to_string(),
                }
            })?,
            ReindexPolicy::Queue => {
                debug!(doc_type = %doc_type, "Waiting for running reindex");
                lock.lock_owned().await
            }
        };

        let _state = StateGuard {
            states: &self.states,
            doc_type,
        };
        self.run(doc_type, documents).await
    }

    fn enter(&self, descriptor: &IndexDescriptor, state: ReindexState) {
        self.states.insert(descriptor.doc_type.clone(), state);
        info!(
            doc_type = %descriptor.doc_type,
            generation = descriptor.generation,
            state = %state,
            "Reindex state changed"
        );
    }

    async fn run(&self, doc_type: &str, documents: &[Document]) -> SearchResult<IndexReport> {
        let alias = self.alias_for(doc_type);
        let previous = self.backend.list_aliases(&alias).await?;
        if previous.len() > 1 {
            warn!(
                alias = %alias,
                bound = ?previous,
                "Alias bound to several generations, the swap will repair it"
            );
        }
        for name in previous.iter().filter_map(|n| IndexName::parse(n)) {
            self.clock.observe(name.generation);
        }

        let descriptor = IndexDescriptor {
            doc_type: doc_type.to_string(),
            generation: self.clock.next(),
            alias,
        };
        let index = descriptor.index_name();

        self.enter(&descriptor, ReindexState::Building);
        self.backend.create_index(&index).await?;

        let (indexed, failures) = match self.load(&descriptor, documents).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(index = %index, error = %e, "Bulk load failed, discarding generation");
                self.discard(&index).await;
                return Err(e);
            }
        };
        if indexed == 0 {
            warn!(index = %index, "No document was accepted, keeping previous generation");
            self.discard(&index).await;
            return Err(SearchError::Indexing(IndexingError::new(doc_type, failures)));
        }

        self.enter(&descriptor, ReindexState::Swapping);
        self.swap(&descriptor, &previous).await?;

        self.enter(&descriptor, ReindexState::Pruning);
        let (pruned, prune_failures) = self.prune(&descriptor).await;

        info!(
            doc_type = %doc_type,
            generation = descriptor.generation,
            indexed,
            failed = failures.len(),
            pruned = pruned.len(),
            "Reindex completed"
        );

        Ok(IndexReport {
            descriptor,
            indexed,
            failures: (!failures.is_empty()).then(|| IndexingError::new(doc_type, failures)),
            pruned,
            prune_failures,
        })
    }

    /// Bulk load in batches; returns the accepted count and the failures
    async fn load(
        &self,
        descriptor: &IndexDescriptor,
        documents: &[Document],
    ) -> SearchResult<(usize, Vec<DocumentFailure>)> {
        let index = descriptor.index_name();
        let batch_size = self.config.bulk_batch_size.max(1);
        let mut indexed = 0;
        let mut failures = Vec::new();

        for (batch_no, batch) in documents.chunks(batch_size).enumerate() {
            let offset = batch_no * batch_size;
            let outcomes = self.load_batch(&index, batch).await?;

            for (i, (document, outcome)) in batch.iter().zip(outcomes).enumerate() {
                match outcome {
                    BulkItemOutcome::Indexed => indexed += 1,
                    BulkItemOutcome::Failed { status, reason } => {
                        warn!(
                            index = %index,
                            position = offset + i,
                            status,
                            reason = %reason,
                            "Document rejected"
                        );
                        failures.push(DocumentFailure::new(
                            offset + i,
                            document.clone(),
                            status,
                            reason,
                        ));
                    }
                }
            }
            debug!(index = %index, batch = batch_no, size = batch.len(), "Batch loaded");
        }

        Ok((indexed, failures))
    }

    /// Load one batch, retrying transient failures with exponential backoff.
    /// Only items the backend reported as busy are resent.
    async fn load_batch(
        &self,
        index: &str,
        batch: &[Document],
    ) -> SearchResult<Vec<BulkItemOutcome>> {
        let max_retries = self.config.bulk_max_retries;
        let batch_timeout = Duration::from_secs(self.config.bulk_timeout_secs);
        let mut outcomes: Vec<Option<BulkItemOutcome>> = vec![None; batch.len()];
        let mut pending: Vec<usize> = (0..batch.len()).collect();
        let mut attempts = 0;

        loop {
            let documents: Vec<Document> = pending.iter().map(|&i| batch[i].clone()).collect();
            let result = match timeout(batch_timeout, self.backend.bulk_load(index, &documents)).await
            {
                Ok(result) => result,
                Err(_) => Err(SearchError::Timeout(format!(
                    "bulk load into '{}' exceeded {}s",
                    index, self.config.bulk_timeout_secs
                ))),
            };

            match result {
                Ok(items) if items.len() == pending.len() => {
                    let mut busy = Vec::new();
                    for (&position, item) in pending.iter().zip(items) {
                        match item {
                            BulkItemOutcome::Failed { status: 429, .. } if attempts < max_retries => {
                                busy.push(position)
                            }
                            item => outcomes[position] = Some(item),
                        }
                    }
                    if busy.is_empty() {
                        break;
                    }
                    pending = busy;
                }
                Ok(items) => {
                    return Err(SearchError::Backend {
                        status: 500,
                        message: format!(
                            "bulk load returned {} outcomes for {} documents",
                            items.len(),
                            pending.len()
                        ),
                    })
                }
                Err(e) if e.is_retryable() && attempts < max_retries => {
                    warn!(index = %index, attempt = attempts + 1, error = %e, "Bulk load failed, retrying");
                }
                Err(e) => return Err(e),
            }

            attempts += 1;
            sleep(self.config.retry_delay(attempts)).await;
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or(BulkItemOutcome::Failed {
                    status: 500,
                    reason: "no outcome reported".to_string(),
                })
            })
            .collect())
    }

    /// Rebind the alias to the new generation in one backend call
    async fn swap(&self, descriptor: &IndexDescriptor, previous: &[String]) -> SearchResult<()> {
        let alias = &descriptor.alias;
        let index = descriptor.index_name();
        let actions = [
            AliasAction::Remove {
                index_pattern: IndexName::pattern(&descriptor.doc_type),
                alias: alias.clone(),
            },
            AliasAction::Add {
                index: index.clone(),
                alias: alias.clone(),
            },
        ];

        let mut last_error = None;
        for attempt in 0..=self.config.alias_swap_retries {
            if attempt > 0 {
                sleep(self.config.retry_delay(attempt)).await;
            }

            match self.backend.update_aliases(&actions).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // The update may have been applied even though the call failed
                    if let Ok(bound) = self.backend.list_aliases(alias).await {
                        if bound == [index.as_str()] {
                            warn!(alias = %alias, error = %e, "Alias update reported failure but was applied");
                            return Ok(());
                        }
                    }
                    warn!(alias = %alias, attempt = attempt + 1, error = %e, "Alias swap failed");
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "alias update failed".to_string());
        error!(alias = %alias, error = %message, "Alias swap gave up, restoring previous binding");

        match self.restore(descriptor, previous).await {
            Ok(()) => {
                self.discard(&index).await;
                Err(SearchError::AliasSwap {
                    alias: alias.clone(),
                    message,
                })
            }
            Err(restore_error) => {
                error!(alias = %alias, error = %restore_error, "Restoring alias binding failed");
                Err(SearchError::AliasSwap {
                    alias: alias.clone(),
                    message: format!(
                        "{}; restoring previous binding failed: {}",
                        message, restore_error
                    ),
                })
            }
        }
    }

    /// Bind the alias back to the newest previous generation and verify it
    async fn restore(&self, descriptor: &IndexDescriptor, previous: &[String]) -> SearchResult<()> {
        let alias = &descriptor.alias;
        let target = previous
            .iter()
            .filter_map(|name| IndexName::parse(name))
            .filter(|name| name.doc_type == descriptor.doc_type)
            .max_by_key(|name| name.generation)
            .map(|name| name.to_string());

        let mut actions = vec![AliasAction::Remove {
            index_pattern: IndexName::pattern(&descriptor.doc_type),
            alias: alias.clone(),
        }];
        if let Some(index) = &target {
            actions.push(AliasAction::Add {
                index: index.clone(),
                alias: alias.clone(),
            });
        }
        self.backend.update_aliases(&actions).await?;

        let bound = self.backend.list_aliases(alias).await?;
        let expected: Vec<String> = target.into_iter().collect();
        if bound != expected {
            return Err(SearchError::AliasSwap {
                alias: alias.clone(),
                message: format!("alias bound to {:?} after restore", bound),
            });
        }
        info!(alias = %alias, bound = ?bound, "Previous alias binding restored");
        Ok(())
    }

    /// Delete every generation of the type except the promoted one
    async fn prune(&self, descriptor: &IndexDescriptor) -> (Vec<String>, Vec<String>) {
        let current = descriptor.index_name();
        let stale: Vec<String> = match self
            .backend
            .list_indices(&IndexName::pattern(&descriptor.doc_type))
            .await
        {
            Ok(indices) => indices
                .into_iter()
                .filter(|name| name != &current)
                .filter(|name| {
                    IndexName::parse(name).is_some_and(|n| n.doc_type == descriptor.doc_type)
                })
                .collect(),
            Err(e) => {
                warn!(doc_type = %descriptor.doc_type, error = %e, "Listing stale generations failed");
                return (Vec::new(), vec![IndexName::pattern(&descriptor.doc_type)]);
            }
        };

        if stale.is_empty() {
            return (Vec::new(), Vec::new());
        }

        match self.backend.delete_indices(&stale).await {
            Ok(()) => {
                debug!(doc_type = %descriptor.doc_type, pruned = ?stale, "Stale generations deleted");
                (stale, Vec::new())
            }
            Err(e) => {
                warn!(doc_type = %descriptor.doc_type, indices = ?stale, error = %e, "Pruning failed");
                (Vec::new(), stale)
            }
        }
    }

    /// Best-effort removal of a generation that never became current
    async fn discard(&self, index: &str) {
        if let Err(e) = self.backend.delete_indices(&[index.to_string()]).await {
            warn!(index = %index, error = %e, "Failed to discard generation");
        }
    }
}
