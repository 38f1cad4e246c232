//! Permission resolution against the access-control service.
//!
//! [`PermissionResolver::permitted_repositories`] is the single
//! authorization chokepoint: the reindex path (through the enumerator) and
//! the query path both call it, so a caller can never index or search a
//! repository the other path would refuse.
//!
//! The permitted set is the union of
//!
//! 1. the caller's own accessible repositories (only for a non-anonymous
//!    token), and
//! 2. every publicly visible repository (fetched without caller identity),
//!
//! deduplicated by repository id. It is computed per request and never
//! cached. If the service cannot be reached the request fails closed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::AccessConfig;
use crate::error::{Error, Result};
use crate::models::Visibility;

/// Bearer token presented by a caller. Absent or blank means anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerToken(Option<String>);

impl CallerToken {
    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            Self(None)
        } else {
            Self(Some(trimmed.to_string()))
        }
    }

    pub fn from_option(token: Option<String>) -> Self {
        token.map(Self::new).unwrap_or_default()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RemoteOwner {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub login: String,
}

impl RemoteOwner {
    pub fn name(&self) -> &str {
        if self.username.is_empty() {
            &self.login
        } else {
            &self.username
        }
    }
}

/// Repository record as returned by the access-control service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteRepository {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub owner: RemoteOwner,
}

impl RemoteRepository {
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    /// `owner/name`, reconstructed when the service omits `full_name`.
    pub fn path_name(&self) -> String {
        if self.full_name.is_empty() {
            format!("{}/{}", self.owner.name(), self.name)
        } else {
            self.full_name.clone()
        }
    }

    pub fn visibility(&self) -> Visibility {
        if self.private {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }
}

/// Reads against the access-control service. Both reads are idempotent and
/// side-effect free.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Repositories the token's owner can access.
    async fn user_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>>;

    /// All publicly visible repositories.
    async fn public_repositories(&self) -> Result<Vec<RemoteRepository>>;

    /// Whether `full_name` is visible to `token`; `AuthorizationDenied` if not.
    async fn repository(&self, token: &CallerToken, full_name: &str) -> Result<RemoteRepository>;
}

/// Deduplicates a list of strings. Order of the result is irrelevant.
pub fn unique_str<I, S>(items: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Repository ids a caller may read, plus the metadata needed to map storage
/// paths back to ids.
#[derive(Debug, Clone, Default)]
pub struct PermittedRepositorySet {
    ids: HashSet<String>,
    by_name: HashMap<String, RemoteRepository>,
}

impl PermittedRepositorySet {
    pub fn from_repositories(repos: Vec<RemoteRepository>) -> Self {
        let ids = unique_str(repos.iter().map(RemoteRepository::id_string));
        let by_name = repos
            .into_iter()
            .map(|r| (r.path_name().to_lowercase(), r))
            .collect();
        Self { ids, by_name }
    }

    pub fn contains(&self, repository_id: &str) -> bool {
        self.ids.contains(repository_id)
    }

    /// Looks up a repository by `owner/name` (case-insensitive).
    pub fn lookup(&self, full_name: &str) -> Option<&RemoteRepository> {
        self.by_name
            .get(&full_name.to_lowercase())
            .filter(|r| self.ids.contains(&r.id_string()))
    }

    /// Sorted ids, for building backend filters.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    access: Arc<dyn AccessControl>,
}

impl PermissionResolver {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self { access }
    }

    pub async fn permitted_repositories(
        &self,
        token: &CallerToken,
    ) -> Result<PermittedRepositorySet> {
        let mut repos = match token.as_str() {
            Some(t) => self.access.user_repositories(t).await?,
            None => Vec::new(),
        };
        let own = repos.len();
        repos.extend(self.access.public_repositories().await?);

        let set = PermittedRepositorySet::from_repositories(repos);
        tracing::debug!(
            anonymous = token.is_anonymous(),
            own,
            permitted = set.len(),
            "resolved permitted repositories"
        );
        Ok(set)
    }

    /// Re-confirms access to one repository right before it is traversed.
    pub async fn confirm(&self, token: &CallerToken, full_name: &str) -> Result<RemoteRepository> {
        self.access.repository(token, full_name).await
    }
}

/// HTTP client for a gin/gogs-compatible access-control API.
pub struct GinAccessClient {
    base_url: String,
    public_search_limit: u64,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<RemoteRepository>,
}

impl GinAccessClient {
    pub fn new(config: &AccessConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            public_search_limit: config.public_search_limit,
            client,
        })
    }

    async fn get(&self, path: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        if let Some(t) = token {
            req = req.header(reqwest::header::AUTHORIZATION, format!("token {}", t));
        }
        req.send().await.map_err(|e| {
            tracing::debug!(%url, error = %e, "access-control request failed");
            Error::AuthorizationServiceUnavailable(e.to_string())
        })
    }
}

fn unexpected_status(status: StatusCode, path: &str) -> Error {
    Error::AuthorizationServiceUnavailable(format!("{} returned {}", path, status))
}

#[async_trait]
impl AccessControl for GinAccessClient {
    async fn user_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        let path = "/api/v1/user/repos";
        let resp = self.get(path, Some(token)).await?;
        match resp.status() {
            s if s.is_success() => resp
                .json::<Vec<RemoteRepository>>()
                .await
                .map_err(|e| Error::AuthorizationServiceUnavailable(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthorizationDenied(
                "token rejected by access-control service".to_string(),
            )),
            s => Err(unexpected_status(s, path)),
        }
    }

    async fn public_repositories(&self) -> Result<Vec<RemoteRepository>> {
        let path = format!("/api/v1/repos/search?limit={}", self.public_search_limit);
        let resp = self.get(&path, None).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(unexpected_status(status, &path));
        }
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::AuthorizationServiceUnavailable(e.to_string()))?;
        Ok(body.data)
    }

    async fn repository(&self, token: &CallerToken, full_name: &str) -> Result<RemoteRepository> {
        let path = format!("/api/v1/repos/{}", full_name);
        let resp = self.get(&path, token.as_str()).await?;
        match resp.status() {
            s if s.is_success() => resp
                .json::<RemoteRepository>()
                .await
                .map_err(|e| Error::AuthorizationServiceUnavailable(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(
                Error::AuthorizationDenied(format!("{} is not visible to caller", full_name)),
            ),
            s => Err(unexpected_status(s, &path)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn repo(id: i64, full_name: &str, private: bool) -> RemoteRepository {
        let (owner, name) = full_name.split_once('/').unwrap();
        RemoteRepository {
            id,
            name: name.to_string(),
            full_name: full_name.to_string(),
            private,
            owner: RemoteOwner {
                username: owner.to_string(),
                login: String::new(),
            },
        }
    }

    /// Static access table: `token -> repositories`, plus the public list.
    #[derive(Default)]
    pub(crate) struct StaticAccess {
        pub(crate) users: HashMap<String, Vec<RemoteRepository>>,
        pub(crate) public: Vec<RemoteRepository>,
        pub(crate) offline: bool,
    }

    #[async_trait]
    impl AccessControl for StaticAccess {
        async fn user_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>> {
            if self.offline {
                return Err(Error::AuthorizationServiceUnavailable("offline".into()));
            }
            Ok(self.users.get(token).cloned().unwrap_or_default())
        }

        async fn public_repositories(&self) -> Result<Vec<RemoteRepository>> {
            if self.offline {
                return Err(Error::AuthorizationServiceUnavailable("offline".into()));
            }
            Ok(self.public.clone())
        }

        async fn repository(
            &self,
            token: &CallerToken,
            full_name: &str,
        ) -> Result<RemoteRepository> {
            let own = token
                .as_str()
                .and_then(|t| self.users.get(t))
                .into_iter()
                .flatten();
            own.chain(self.public.iter())
                .find(|r| r.full_name == full_name)
                .cloned()
                .ok_or_else(|| Error::AuthorizationDenied(full_name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{repo, StaticAccess};
    use super::*;

    fn access() -> StaticAccess {
        let mut users = HashMap::new();
        users.insert(
            "alice-token".to_string(),
            vec![repo(1, "alice/private", true), repo(2, "alice/shared", false)],
        );
        StaticAccess {
            users,
            public: vec![repo(2, "alice/shared", false), repo(3, "bob/open", false)],
            offline: false,
        }
    }

    #[test]
    fn unique_str_deduplicates() {
        let set = unique_str(["a", "b", "a", "c"]);
        assert_eq!(set.len(), 3);
        assert_eq!(set, unique_str(["c", "b", "a"]));
    }

    #[test]
    fn blank_token_is_anonymous() {
        assert!(CallerToken::new("   ").is_anonymous());
        assert!(CallerToken::from_option(None).is_anonymous());
        assert_eq!(CallerToken::new(" t ").as_str(), Some("t"));
    }

    #[tokio::test]
    async fn anonymous_caller_sees_only_public() {
        let resolver = PermissionResolver::new(Arc::new(access()));
        let set = resolver
            .permitted_repositories(&CallerToken::anonymous())
            .await
            .unwrap();
        assert_eq!(set.ids(), vec!["2".to_string(), "3".to_string()]);
        assert!(set.lookup("alice/private").is_none());
    }

    #[tokio::test]
    async fn token_caller_sees_union_deduplicated() {
        let resolver = PermissionResolver::new(Arc::new(access()));
        let set = resolver
            .permitted_repositories(&CallerToken::new("alice-token"))
            .await
            .unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains("1"));
        assert_eq!(set.lookup("Alice/Private").map(|r| r.id), Some(1));
    }

    #[tokio::test]
    async fn unavailable_service_fails_closed() {
        let mut a = access();
        a.offline = true;
        let resolver = PermissionResolver::new(Arc::new(a));
        let err = resolver
            .permitted_repositories(&CallerToken::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationServiceUnavailable(_)));
    }

    #[test]
    fn path_name_falls_back_to_owner_and_name() {
        let mut r = repo(9, "carol/data", false);
        r.full_name.clear();
        assert_eq!(r.path_name(), "carol/data");
    }

    #[test]
    fn deserializes_service_payload() {
        let json = r#"{
            "id": 5,
            "name": "x",
            "full_name": "o/x",
            "private": true,
            "owner": {"login": "o", "username": "o"}
        }"#;
        let r: RemoteRepository = serde_json::from_str(json).unwrap();
        assert_eq!(r.owner.name(), "o");
        assert_eq!(r.visibility(), Visibility::Private);
    }
}
