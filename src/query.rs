//! Authorization-scoped search and suggest.
//!
//! Every query sent to the backend carries an explicit
//! `terms: { repositoryID: [...] }` filter built from the caller's permitted
//! set. An empty set produces an empty terms list, which matches nothing;
//! an unscoped query is never issued.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::access::{CallerToken, PermissionResolver};
use crate::backend::SearchBackend;
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::indexer::IndexNames;

/// Page size when the caller does not ask for one.
const DEFAULT_PAGE_SIZE: usize = 10;

/// Which partitions a search covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    #[default]
    All,
    #[serde(alias = "blob")]
    Blobs,
    #[serde(alias = "commit")]
    Commits,
}

impl FromStr for SearchKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(SearchKind::All),
            "blob" | "blobs" => Ok(SearchKind::Blobs),
            "commit" | "commits" => Ok(SearchKind::Commits),
            other => Err(Error::MalformedRequest(format!(
                "unknown kind '{}', expected all, blobs or commits",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub kind: SearchKind,
    pub from: usize,
    pub size: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Wraps `clause` in a bool query filtered to `repository_ids`.
pub fn scoped_query(clause: Value, repository_ids: &[String]) -> Value {
    json!({
        "bool": {
            "must": [clause],
            "filter": [{ "terms": { "repositoryID": repository_ids } }]
        }
    })
}

pub struct QueryGateway {
    resolver: PermissionResolver,
    backend: Arc<dyn SearchBackend>,
    indices: IndexNames,
    max_results: usize,
    suggest_size: usize,
}

impl QueryGateway {
    pub fn new(
        resolver: PermissionResolver,
        backend: Arc<dyn SearchBackend>,
        indices: IndexNames,
        config: &QueryConfig,
    ) -> Self {
        Self {
            resolver,
            backend,
            indices,
            max_results: config.max_results,
            suggest_size: config.suggest_size,
        }
    }

    pub async fn search(&self, token: &CallerToken, request: &SearchRequest) -> Result<Value> {
        let text = non_empty(&request.query)?;
        let ids = self.resolver.permitted_repositories(token).await?.ids();
        let size = request.size.unwrap_or(DEFAULT_PAGE_SIZE).min(self.max_results);

        let body = json!({
            "from": request.from,
            "size": size,
            "query": scoped_query(
                json!({ "multi_match": { "query": text, "fields": ["text", "sourcePath"] } }),
                &ids,
            ),
            "highlight": { "fields": { "text": {}, "sourcePath": {} } }
        });
        let indices = self.indices_for(request.kind);
        tracing::debug!(query = text, kind = ?request.kind, repositories = ids.len(), "search");
        self.backend.search(&indices, &body).await
    }

    pub async fn suggest(&self, token: &CallerToken, partial: &str) -> Result<Value> {
        let text = non_empty(partial)?;
        let ids = self.resolver.permitted_repositories(token).await?.ids();

        let body = json!({
            "size": self.suggest_size,
            "_source": ["repositoryID", "objectID", "kind", "sourcePath"],
            "query": scoped_query(
                json!({ "match_phrase_prefix": { "text": { "query": text } } }),
                &ids,
            )
        });
        tracing::debug!(partial = text, repositories = ids.len(), "suggest");
        self.backend.search(&self.indices.all(), &body).await
    }

    fn indices_for(&self, kind: SearchKind) -> Vec<&str> {
        match kind {
            SearchKind::All => self.indices.all().to_vec(),
            SearchKind::Blobs => vec![self.indices.blobs.as_str()],
            SearchKind::Commits => vec![self.indices.commits.as_str()],
        }
    }
}

fn non_empty(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        return Err(Error::MalformedRequest("query must not be empty".to_string()));
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::access::test_support::{repo, StaticAccess};
    use crate::backend::MemoryBackend;

    async fn gateway(access: StaticAccess) -> (QueryGateway, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        for (id, repo_id, index, text) in [
            ("a", "1", "blobs", "spike sorting notes"),
            ("b", "2", "blobs", "spike train analysis"),
            ("c", "2", "commits", "add spike detector"),
        ] {
            let doc = json!({ "repositoryID": repo_id, "text": text, "sourcePath": "" });
            backend.put_document(index, id, &doc).await.unwrap();
        }
        let gateway = QueryGateway::new(
            PermissionResolver::new(Arc::new(access)),
            backend.clone(),
            IndexNames::default(),
            &QueryConfig {
                max_results: 5,
                suggest_size: 3,
            },
        );
        (gateway, backend)
    }

    fn access() -> StaticAccess {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), vec![repo(1, "alice/private", true)]);
        StaticAccess {
            users,
            public: vec![repo(2, "bob/open", false)],
            offline: false,
        }
    }

    fn ids(res: &Value) -> Vec<String> {
        let mut ids: Vec<String> = res["hits"]["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["_id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn anonymous_sees_public_only() {
        let (gateway, _) = gateway(access()).await;
        let res = gateway
            .search(&CallerToken::anonymous(), &SearchRequest::new("spike"))
            .await
            .unwrap();
        assert_eq!(ids(&res), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn token_adds_own_repositories() {
        let (gateway, _) = gateway(access()).await;
        let res = gateway
            .search(&CallerToken::new("alice"), &SearchRequest::new("spike"))
            .await
            .unwrap();
        assert_eq!(ids(&res), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn kind_selects_partition() {
        let (gateway, _) = gateway(access()).await;
        let request = SearchRequest {
            kind: SearchKind::Commits,
            ..SearchRequest::new("spike")
        };
        let res = gateway.search(&CallerToken::anonymous(), &request).await.unwrap();
        assert_eq!(ids(&res), vec!["c"]);
    }

    #[tokio::test]
    async fn empty_permitted_set_still_filters() {
        let (gateway, backend) = gateway(StaticAccess::default()).await;
        let res = gateway
            .search(&CallerToken::anonymous(), &SearchRequest::new("spike"))
            .await
            .unwrap();
        assert_eq!(res["hits"]["total"]["value"], 0);

        let sent = backend.queries().pop().unwrap();
        let terms = &sent["query"]["bool"]["filter"][0]["terms"]["repositoryID"];
        assert_eq!(terms, &json!([]));
    }

    #[tokio::test]
    async fn size_is_capped() {
        let (gateway, backend) = gateway(access()).await;
        let request = SearchRequest {
            size: Some(1000),
            ..SearchRequest::new("spike")
        };
        gateway.search(&CallerToken::anonymous(), &request).await.unwrap();
        assert_eq!(backend.queries()[0]["size"], 5);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (gateway, backend) = gateway(access()).await;
        let err = gateway
            .search(&CallerToken::anonymous(), &SearchRequest::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
        assert!(backend.queries().is_empty());
    }

    #[tokio::test]
    async fn unavailable_access_service_never_queries_backend() {
        let (gateway, backend) = gateway(StaticAccess {
            offline: true,
            ..Default::default()
        })
        .await;
        let err = gateway
            .suggest(&CallerToken::anonymous(), "spi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationServiceUnavailable(_)));
        assert!(backend.queries().is_empty());
    }

    #[tokio::test]
    async fn suggest_uses_prefix_match() {
        let (gateway, backend) = gateway(access()).await;
        gateway.suggest(&CallerToken::anonymous(), "spike").await.unwrap();
        let sent = &backend.queries()[0];
        assert_eq!(sent["size"], 3);
        assert_eq!(
            sent["query"]["bool"]["must"][0]["match_phrase_prefix"]["text"]["query"],
            "spike"
        );
    }

    #[test]
    fn parses_kind() {
        assert_eq!("blob".parse::<SearchKind>().unwrap(), SearchKind::Blobs);
        assert_eq!("Commits".parse::<SearchKind>().unwrap(), SearchKind::Commits);
        assert!("trees".parse::<SearchKind>().is_err());
    }
}
