//! Search engine configuration

use crate::search::error::{SearchError, SearchResult};
use base64ct::{Base64, Base64Unpadded, Encoding};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use validator::Validate;

/// Smallest writer heap tantivy accepts for a single indexing thread
pub const MIN_WRITER_HEAP_SIZE: usize = 15_000_000;

/// Upper bound of a single retry delay
pub const MAX_RETRY_BACKOFF_MS: u64 = 30_000;

/// Which engine implementation to construct
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineKind {
    /// In-process tantivy indices
    #[default]
    Memory,
    /// Networked Elasticsearch/OpenSearch cluster
    Elasticsearch,
}

/// Hosting provider of the cluster, selects the connection strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    /// elastic.co hosted cluster, addressed by Cloud ID
    Elastic,
    /// Amazon OpenSearch/Elasticsearch Service
    Aws,
    /// Self-hosted or other
    Custom,
}

/// What to do when a reindex of a type is requested while one is running
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReindexPolicy {
    /// Fail fast with `ReindexInProgress`
    #[default]
    Reject,
    /// Wait for the running reindex, then run
    Queue,
}

/// Cluster credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Base64 encoded API key
    pub api_key: Option<String>,
    /// Bearer (service) token
    pub bearer: Option<String>,
}

/// Resolved credential, tokens take precedence over username/password
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Bearer(String),
    Basic { username: String, password: String },
}

impl AuthConfig {
    /// The credential that will be sent, if any
    pub fn credentials(&self) -> SearchResult<Option<Credentials>> {
        if let Some(key) = non_empty(&self.api_key) {
            return Ok(Some(Credentials::ApiKey(key)));
        }
        if let Some(token) = non_empty(&self.bearer) {
            return Ok(Some(Credentials::Bearer(token)));
        }
        match (non_empty(&self.username), non_empty(&self.password)) {
            (Some(username), Some(password)) => Ok(Some(Credentials::Basic { username, password })),
            (Some(username), None) => Err(SearchError::Configuration(format!(
                "auth.username '{}' is set without auth.password",
                username
            ))),
            (None, Some(_)) => Err(SearchError::Configuration(
                "auth.password is set without auth.username".to_string(),
            )),
            (None, None) => Ok(None),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Connection settings for the cluster engine
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ElasticsearchConfig {
    pub provider: Provider,

    /// One or more node URLs
    #[serde(default, deserialize_with = "one_or_many")]
    pub node: Vec<String>,

    /// elastic.co Cloud ID
    pub cloud_id: Option<String>,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Per request timeout in seconds
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl ElasticsearchConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            node: Vec::new(),
            cloud_id: None,
            auth: None,
            request_timeout_secs: default_request_timeout(),
        }
    }

    /// Base URLs requests are sent to
    pub fn endpoints(&self) -> SearchResult<Vec<String>> {
        let endpoints = match self.provider {
            Provider::Elastic => {
                let cloud_id = non_empty(&self.cloud_id).ok_or_else(|| {
                    SearchError::Configuration(
                        "provider 'elastic' requires 'cloud_id'".to_string(),
                    )
                })?;
                vec![decode_cloud_id(&cloud_id)?]
            }
            Provider::Aws | Provider::Custom => {
                if self.node.is_empty() {
                    return Err(SearchError::Configuration(format!(
                        "provider '{}' requires at least one 'node'",
                        self.provider
                    )));
                }
                self.node.clone()
            }
        };

        endpoints
            .into_iter()
            .map(|endpoint| {
                let url = reqwest::Url::parse(&endpoint).map_err(|e| {
                    SearchError::Configuration(format!("invalid node URL '{}': {}", endpoint, e))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(SearchError::Configuration(format!(
                        "node URL '{}' must use http or https",
                        endpoint
                    )));
                }
                Ok(endpoint.trim_end_matches('/').to_string())
            })
            .collect()
    }

    /// Credentials to attach to every request
    pub fn credentials(&self) -> SearchResult<Option<Credentials>> {
        match &self.auth {
            Some(auth) => auth.credentials(),
            None => Ok(None),
        }
    }
}

/// Decode an elastic.co Cloud ID (`name:base64(host$es_uuid$kibana_uuid)`)
/// into the Elasticsearch endpoint URL.
pub fn decode_cloud_id(cloud_id: &str) -> SearchResult<String> {
    let invalid = |reason: &str| {
        SearchError::Configuration(format!("invalid cloud_id '{}': {}", cloud_id, reason))
    };

    let encoded = cloud_id
        .split_once(':')
        .map(|(_, encoded)| encoded)
        .ok_or_else(|| invalid("missing ':' separator"))?;

    let decoded = Base64::decode_vec(encoded)
        .or_else(|_| Base64Unpadded::decode_vec(encoded))
        .map_err(|_| invalid("not valid base64"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid("not valid UTF-8"))?;

    let mut parts = decoded.split('$');
    let host = parts.next().filter(|h| !h.is_empty());
    let es_uuid = parts.next().filter(|u| !u.is_empty());
    match (host, es_uuid) {
        (Some(host), Some(es_uuid)) => Ok(format!("https://{}.{}", es_uuid, host)),
        _ => Err(invalid("expected 'host$es_uuid$kibana_uuid'")),
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(node) => node
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect(),
        OneOrMany::Many(nodes) => nodes,
    })
}

/// Search engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SearchConfig {
    /// Engine implementation
    #[serde(default)]
    pub engine: EngineKind,

    /// Suffix forming the alias of each type (`<type>__<postfix>`)
    #[serde(default = "default_alias_postfix")]
    #[validate(length(min = 1))]
    pub alias_postfix: String,

    /// Documents per bulk request
    #[serde(default = "default_bulk_batch_size")]
    #[validate(range(min = 1))]
    pub bulk_batch_size: usize,

    /// Time budget of one bulk request in seconds
    #[serde(default = "default_bulk_timeout")]
    #[validate(range(min = 1))]
    pub bulk_timeout_secs: u64,

    /// Retries of a bulk request, or of documents the backend was too busy for
    #[serde(default = "default_bulk_max_retries")]
    #[validate(range(max = 20))]
    pub bulk_max_retries: u32,

    /// Base delay of the exponential retry backoff in milliseconds
    #[serde(default = "default_retry_backoff")]
    #[validate(range(max = 60_000))]
    pub retry_backoff_ms: u64,

    /// Time budget of a query in seconds
    #[serde(default = "default_query_timeout")]
    #[validate(range(min = 1))]
    pub query_timeout_secs: u64,

    /// Maximum hits returned by a query
    #[serde(default = "default_max_results")]
    #[validate(range(min = 1))]
    pub max_results: usize,

    /// Attempts of the atomic alias rebind before it is reported as failed
    #[serde(default = "default_alias_swap_retries")]
    #[validate(range(min = 1, max = 20))]
    pub alias_swap_retries: u32,

    /// Concurrent reindex handling for one type
    #[serde(default)]
    pub reindex_policy: ReindexPolicy,

    /// Index writer heap size in bytes for the in-memory engine
    #[serde(default = "default_writer_heap_size")]
    #[validate(range(min = 15_000_000))]
    pub writer_heap_size: usize,

    /// Cluster settings, required for the elasticsearch engine
    #[serde(default)]
    #[validate(nested)]
    pub elasticsearch: Option<ElasticsearchConfig>,
}

fn default_alias_postfix() -> String {
    "search".to_string()
}

fn default_bulk_batch_size() -> usize {
    500
}

fn default_bulk_timeout() -> u64 {
    30
}

fn default_bulk_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    200
}

fn default_query_timeout() -> u64 {
    10
}

fn default_max_results() -> usize {
    100
}

fn default_alias_swap_retries() -> u32 {
    3
}

fn default_writer_heap_size() -> usize {
    50_000_000 // 50MB
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            alias_postfix: default_alias_postfix(),
            bulk_batch_size: default_bulk_batch_size(),
            bulk_timeout_secs: default_bulk_timeout(),
            bulk_max_retries: default_bulk_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            query_timeout_secs: default_query_timeout(),
            max_results: default_max_results(),
            alias_swap_retries: default_alias_swap_retries(),
            reindex_policy: ReindexPolicy::default(),
            writer_heap_size: default_writer_heap_size(),
            elasticsearch: None,
        }
    }
}

impl SearchConfig {
    /// Delay before retry number `attempt` (1-based), doubling per attempt
    /// and capped at [`MAX_RETRY_BACKOFF_MS`]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let delay = self.retry_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(MAX_RETRY_BACKOFF_MS))
    }

    /// Check field ranges and the provider specific requirements
    pub fn validate(&self) -> SearchResult<()> {
        Validate::validate(self).map_err(|e| SearchError::Configuration(e.to_string()))?;

        if self.alias_postfix.contains(['*', ',', '/']) {
            return Err(SearchError::Configuration(format!(
                "alias_postfix '{}' contains reserved characters",
                self.alias_postfix
            )));
        }

        match (self.engine, &self.elasticsearch) {
            (EngineKind::Elasticsearch, None) => Err(SearchError::Configuration(
                "engine 'elasticsearch' requires an [elasticsearch] section".to_string(),
            )),
            (EngineKind::Elasticsearch, Some(es)) => {
                es.endpoints()?;
                es.credentials()?;
                Ok(())
            }
            (EngineKind::Memory, _) => Ok(()),
        }
    }
}

/// Builder for SearchConfig
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SearchConfig::default(),
        }
    }

    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn alias_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.config.alias_postfix = postfix.into();
        self
    }

    pub fn bulk_batch_size(mut self, size: usize) -> Self {
        self.config.bulk_batch_size = size;
        self
    }

    pub fn bulk_timeout_secs(mut self, secs: u64) -> Self {
        self.config.bulk_timeout_secs = secs;
        self
    }

    pub fn bulk_max_retries(mut self, retries: u32) -> Self {
        self.config.bulk_max_retries = retries;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn query_timeout_secs(mut self, secs: u64) -> Self {
        self.config.query_timeout_secs = secs;
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.config.max_results = max;
        self
    }

    pub fn alias_swap_retries(mut self, retries: u32) -> Self {
        self.config.alias_swap_retries = retries;
        self
    }

    pub fn reindex_policy(mut self, policy: ReindexPolicy) -> Self {
        self.config.reindex_policy = policy;
        self
    }

    pub fn writer_heap_size(mut self, size: usize) -> Self {
        self.config.writer_heap_size = size;
        self
    }

    pub fn elasticsearch(mut self, elasticsearch: ElasticsearchConfig) -> Self {
        self.config.engine = EngineKind::Elasticsearch;
        self.config.elasticsearch = Some(elasticsearch);
        self
    }

    pub fn build(self) -> SearchConfig {
        self.config
    }
}

impl Default for SearchConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
