//! Search backend wire protocol.
//!
//! The backend is an Elasticsearch-compatible HTTP service. Documents are
//! written with `PUT /{index}/_doc/{id}`, which replaces any existing
//! document under the same id, and queried with `POST /{indices}/_search`.
//!
//! [`MemoryBackend`] keeps documents in process. It backs `reindex --dry-run`
//! and the test suites, and evaluates the repository filter of a query the
//! same way the real backend does.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Idempotent write of `body` under `(index, id)`.
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<()>;

    /// Runs `query` against `indices` and returns the backend response as-is.
    async fn search(&self, indices: &[&str], query: &Value) -> Result<Value>;
}

/// Field mapping applied when an index is created.
fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "repositoryID": { "type": "keyword" },
                "objectID": { "type": "keyword" },
                "kind": { "type": "keyword" },
                "sourcePath": { "type": "text", "fields": { "raw": { "type": "keyword" } } },
                "text": { "type": "text" }
            }
        }
    })
}

pub struct ElasticClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ElasticClient {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    /// A request that ran out of time is a [`Error::Timeout`]; any other
    /// transport failure means the backend is unavailable.
    fn transport(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::BackendUnavailable(e.to_string())
        }
    }

    /// Cluster info (`GET /`); fails when the backend cannot be reached.
    pub async fn ping(&self) -> Result<Value> {
        let resp = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    /// Verifies connectivity and creates missing indices.
    pub async fn init(&self, indices: &[&str]) -> Result<()> {
        self.ping().await?;

        for index in indices {
            let url = format!("{}/{}", self.base_url, index);
            let resp = self
                .client
                .head(&url)
                .send()
                .await
                .map_err(|e| self.transport(e))?;
            if resp.status() == StatusCode::NOT_FOUND {
                tracing::info!(index, "creating index");
                let resp = self
                    .client
                    .put(&url)
                    .json(&index_mapping())
                    .send()
                    .await
                    .map_err(|e| self.transport(e))?;
                check_status(resp).await?;
            } else {
                check_status(resp).await?;
            }
        }
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::BackendRejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SearchBackend for ElasticClient {
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        let resp = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        check_status(resp).await?;
        Ok(())
    }

    async fn search(&self, indices: &[&str], query: &Value) -> Result<Value> {
        let url = format!("{}/{}/_search", self.base_url, indices.join(","));
        let resp = self
            .client
            .post(&url)
            .json(query)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("invalid search response: {}", e)))
    }
}

/// In-process backend keyed by `(index, id)`.
#[derive(Default)]
pub struct MemoryBackend {
    documents: Mutex<BTreeMap<(String, String), Value>>,
    queries: Mutex<Vec<Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, index: &str) -> usize {
        self.documents
            .lock()
            .map(|d| d.keys().filter(|(i, _)| i == index).count())
            .unwrap_or(0)
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .ok()?
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Every document body, in key order.
    pub fn documents(&self) -> Vec<Value> {
        self.documents
            .lock()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Query bodies received so far.
    pub fn queries(&self) -> Vec<Value> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

/// Pulls `(repository filter, search text)` out of a query built by the
/// query gateway. A missing filter is `None` (unscoped).
fn query_terms(query: &Value) -> (Option<Vec<String>>, String) {
    let bool_query = &query["query"]["bool"];
    let filter = bool_query["filter"].as_array().and_then(|filters| {
        filters.iter().find_map(|f| {
            f["terms"]["repositoryID"].as_array().map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
        })
    });
    let clause = &bool_query["must"][0];
    let text = ["match", "match_phrase_prefix", "multi_match"]
        .iter()
        .find_map(|k| {
            let c = &clause[*k];
            c["text"]["query"]
                .as_str()
                .or_else(|| c["query"].as_str())
                .or_else(|| c["text"].as_str())
        })
        .unwrap_or_default()
        .to_lowercase();
    (filter, text)
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|_| Error::BackendUnavailable("memory backend poisoned".to_string()))?;
        docs.insert((index.to_string(), id.to_string()), body.clone());
        Ok(())
    }

    async fn search(&self, indices: &[&str], query: &Value) -> Result<Value> {
        if let Ok(mut q) = self.queries.lock() {
            q.push(query.clone());
        }
        let (filter, text) = query_terms(query);
        let docs = self
            .documents
            .lock()
            .map_err(|_| Error::BackendUnavailable("memory backend poisoned".to_string()))?;

        let hits: Vec<Value> = docs
            .iter()
            .filter(|((index, _), _)| indices.contains(&index.as_str()))
            .filter(|(_, doc)| match &filter {
                Some(ids) => doc["repositoryID"]
                    .as_str()
                    .map_or(false, |id| ids.iter().any(|i| i == id)),
                None => true,
            })
            .filter(|(_, doc)| {
                let haystack = format!(
                    "{} {}",
                    doc["text"].as_str().unwrap_or_default(),
                    doc["sourcePath"].as_str().unwrap_or_default()
                )
                .to_lowercase();
                text.split_whitespace().all(|w| haystack.contains(w))
            })
            .map(|((index, id), doc)| json!({ "_index": index, "_id": id, "_source": doc }))
            .collect();

        Ok(json!({ "hits": { "total": { "value": hits.len() }, "hits": hits } }))
    }
}
