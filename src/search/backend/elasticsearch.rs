//! Elasticsearch compatible cluster backend over the REST API

use crate::search::backend::{AliasAction, BackendClient, BulkItemOutcome, RawHit};
use crate::search::config::{Credentials, ElasticsearchConfig};
use crate::search::document::Document;
use crate::search::error::{SearchError, SearchResult};
use crate::search::query::{BoolQuery, Fuzziness, IndexTarget, QueryDsl, TranslatedQuery};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const NDJSON: &str = "application/x-ndjson";
const JSON: &str = "application/json";

/// Cluster backend speaking the Elasticsearch REST protocol.
///
/// Requests rotate over the configured nodes; a node that refuses the
/// connection is skipped and the next one tried.
pub struct ElasticsearchBackend {
    client: Client,
    endpoints: Vec<String>,
    next: AtomicUsize,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_score")]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: Document,
}

impl ElasticsearchBackend {
    /// Create a backend from validated connection settings
    pub fn new(config: &ElasticsearchConfig) -> SearchResult<Self> {
        let endpoints = config.endpoints()?;
        let credentials = config.credentials()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                SearchError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        debug!(
            provider = %config.provider,
            nodes = endpoints.len(),
            authenticated = credentials.is_some(),
            "Elasticsearch backend configured"
        );

        Ok(Self {
            client,
            endpoints,
            next: AtomicUsize::new(0),
            credentials,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(Credentials::ApiKey(key)) => {
                request.header("Authorization", format!("ApiKey {}", key))
            }
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            Some(Credentials::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        }
    }

    /// Send a request, failing over to the next node on connection errors
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<(&'static str, String)>,
    ) -> SearchResult<(StatusCode, String)> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for attempt in 0..self.endpoints.len() {
            let endpoint = &self.endpoints[(start + attempt) % self.endpoints.len()];
            let url = format!("{}{}", endpoint, path);

            let mut request = self.authorize(self.client.request(method.clone(), &url));
            if let Some((content_type, body)) = &body {
                request = request
                    .header("Content-Type", *content_type)
                    .body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await?;
                    return Ok((status, text));
                }
                Err(e) if e.is_connect() => {
                    warn!(node = %endpoint, error = %e, "Node unreachable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(match last_error {
            Some(e) => SearchError::Connection(format!("No reachable node: {}", e)),
            None => SearchError::Configuration("No nodes configured".to_string()),
        })
    }

    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> SearchResult<(StatusCode, String)> {
        self.send(method, path, Some((JSON, serde_json::to_string(body)?)))
            .await
    }
}

/// Map a non-success response onto the error taxonomy
fn check(status: StatusCode, body: &str) -> SearchResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let reason = error_reason(body);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SearchError::Connection(format!(
            "Authentication rejected ({}): {}",
            status.as_u16(),
            reason
        )));
    }
    Err(SearchError::Backend {
        status: status.as_u16(),
        message: reason,
    })
}

/// `type: reason` of an error body, or the raw body
fn error_reason(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    match parsed.as_ref().and_then(|v| v.get("error")) {
        Some(error @ Value::Object(_)) => describe_error(error),
        Some(Value::String(message)) => message.clone(),
        _ => body.chars().take(512).collect(),
    }
}

fn describe_error(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
    match error.get("reason").and_then(Value::as_str) {
        Some(reason) => format!("{}: {}", kind, reason),
        None => kind.to_string(),
    }
}

/// Render the neutral query tree as Elasticsearch query DSL
pub fn render_query(dsl: &QueryDsl) -> Value {
    match dsl {
        QueryDsl::MatchAll => json!({ "match_all": {} }),
        QueryDsl::MatchNone => json!({ "match_none": {} }),
        QueryDsl::MultiMatch {
            query,
            fields,
            fuzziness,
            minimum_should_match,
        } => {
            let mut body = Map::new();
            body.insert("query".into(), json!(query));
            if !fields.is_empty() {
                body.insert("fields".into(), json!(fields));
            }
            let fuzziness = match fuzziness {
                Fuzziness::Auto => json!("AUTO"),
                Fuzziness::Fixed(distance) => json!(distance),
            };
            body.insert("fuzziness".into(), fuzziness);
            body.insert("minimum_should_match".into(), json!(minimum_should_match));
            // Fields mapped as numbers or dates must not fail a text query
            body.insert("lenient".into(), json!(true));
            json!({ "multi_match": body })
        }
        QueryDsl::Term { field, value } => match value {
            Value::Array(values) => render_terms(field, values),
            value => json!({ "term": { exact_field(field, value): value } }),
        },
        QueryDsl::Terms { field, values } => render_terms(field, values),
        QueryDsl::Bool(query) => render_bool(query),
    }
}

/// Strings are matched against the dynamic `keyword` sub-field
fn exact_field(field: &str, value: &Value) -> String {
    if value.is_string() {
        format!("{}.keyword", field)
    } else {
        field.to_string()
    }
}

fn render_terms(field: &str, values: &[Value]) -> Value {
    if values.is_empty() {
        return json!({ "match_none": {} });
    }
    let all_strings = values.iter().all(Value::is_string);
    let field = if all_strings {
        format!("{}.keyword", field)
    } else {
        field.to_string()
    };
    json!({ "terms": { field: values } })
}

fn render_bool(query: &BoolQuery) -> Value {
    let mut body = Map::new();
    for (key, clauses) in [
        ("must", &query.must),
        ("should", &query.should),
        ("filter", &query.filter),
        ("must_not", &query.must_not),
    ] {
        if !clauses.is_empty() {
            body.insert(
                key.to_string(),
                Value::Array(clauses.iter().map(render_query).collect()),
            );
        }
    }
    json!({ "bool": body })
}

/// Newline delimited bulk body indexing every document into `index`
fn bulk_body(index: &str, documents: &[Document]) -> SearchResult<String> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
    let mut body = String::new();
    for document in documents {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl BackendClient for ElasticsearchBackend {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn create_index(&self, index: &str) -> SearchResult<()> {
        let (status, body) = self.send(Method::PUT, &format!("/{}", index), None).await?;
        check(status, &body)
    }

    async fn bulk_load(
        &self,
        index: &str,
        documents: &[Document],
    ) -> SearchResult<Vec<BulkItemOutcome>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = bulk_body(index, documents)?;
        let (status, body) = self
            .send(Method::POST, "/_bulk?refresh=true", Some((NDJSON, body)))
            .await?;
        check(status, &body)?;

        let response: BulkResponse = serde_json::from_str(&body)?;
        if response.items.len() != documents.len() {
            return Err(SearchError::Serialization(format!(
                "Bulk response has {} items for {} documents",
                response.items.len(),
                documents.len()
            )));
        }

        // Items come back in request order, one operation key each
        Ok(response
            .items
            .into_iter()
            .map(|item| match item.into_values().next() {
                Some(BulkItem { error: None, status }) if status < 300 => BulkItemOutcome::Indexed,
                Some(BulkItem { error, status }) => BulkItemOutcome::Failed {
                    status,
                    reason: error
                        .as_ref()
                        .map(describe_error)
                        .unwrap_or_else(|| format!("status {}", status)),
                },
                None => BulkItemOutcome::Failed {
                    status: 500,
                    reason: "empty bulk item".to_string(),
                },
            })
            .collect())
    }

    async fn list_aliases(&self, alias: &str) -> SearchResult<Vec<String>> {
        let (status, body) = self
            .send(Method::GET, &format!("/_alias/{}", alias), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check(status, &body)?;

        let bindings: HashMap<String, Value> = serde_json::from_str(&body)?;
        let mut indices: Vec<String> = bindings.into_keys().collect();
        indices.sort();
        Ok(indices)
    }

    async fn list_indices(&self, pattern: &str) -> SearchResult<Vec<String>> {
        let path = format!("/_cat/indices/{}?format=json&h=index", pattern);
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check(status, &body)?;

        let rows: Vec<CatIndex> = serde_json::from_str(&body)?;
        let mut indices: Vec<String> = rows.into_iter().map(|row| row.index).collect();
        indices.sort();
        Ok(indices)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> SearchResult<()> {
        let actions: Vec<Value> = actions
            .iter()
            .map(|action| match action {
                AliasAction::Remove {
                    index_pattern,
                    alias,
                } => json!({ "remove": { "index": index_pattern, "alias": alias } }),
                AliasAction::Add { index, alias } => {
                    json!({ "add": { "index": index, "alias": alias } })
                }
            })
            .collect();

        let (status, body) = self
            .send_json(Method::POST, "/_aliases", &json!({ "actions": actions }))
            .await?;
        check(status, &body)
    }

    async fn delete_indices(&self, indices: &[String]) -> SearchResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let path = format!("/{}?ignore_unavailable=true", indices.join(","));
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(status, &body)
    }

    async fn search(
        &self,
        target: &IndexTarget,
        query: &TranslatedQuery,
    ) -> SearchResult<Vec<RawHit>> {
        if matches!(target, IndexTarget::Aliases(aliases) if aliases.is_empty()) {
            return Ok(Vec::new());
        }

        let mut request = Map::new();
        request.insert("query".into(), render_query(&query.query));
        if let Some(size) = query.size {
            request.insert("size".into(), json!(size));
        }

        let path = format!(
            "/{}/_search?ignore_unavailable=true&allow_no_indices=true",
            target.selector()
        );
        let (status, body) = self
            .send_json(Method::POST, &path, &Value::Object(request))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check(status, &body)?;

        let response: SearchResponse = serde_json::from_str(&body)?;
        Ok(response
            .hits
            .hits
            .into_iter()
            .map(|hit| RawHit {
                index: hit.index,
                source: hit.source,
                score: hit.score,
            })
            .collect())
    }
}
