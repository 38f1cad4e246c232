//! Reindex orchestration.
//!
//! A pass moves through `Enumerating -> (Traversing -> Extracting ->
//! Submitting)* -> Completed | TimedOut | Failed`:
//!
//! 1. The caller's permitted set is resolved once and the store is walked
//!    lazily by the [`Enumerator`].
//! 2. Each authorized repository is handed to a bounded worker pool
//!    (`reindex.workers` permits). Before traversal the repository's
//!    visibility is re-confirmed with the access-control service.
//! 3. Within a repository, objects are processed one at a time: every
//!    commit reachable from any ref, then every blob in the trees of the
//!    branch heads (each blob id once per repository).
//!
//! A single wall-clock deadline covers the whole pass. It is checked before
//! a repository is started and between objects; once it has passed, no new
//! repository starts and running ones stop at the next object boundary.
//! Documents submitted before that point stay in the index.
//!
//! A failure of the access-control service while a repository is being
//! re-confirmed aborts the whole pass: the remaining repository tasks are
//! cancelled and the caller gets the error instead of a report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::access::{CallerToken, PermissionResolver};
use crate::config::Config;
use crate::enumerate::Enumerator;
use crate::error::{Error, Result};
use crate::extract::{self, ContentClass, ExtractError, SizeLimits, FIXED_HEADER_LEN};
use crate::git::{GitRepo, TreeBlob};
use crate::indexer::{build_document, Indexer};
use crate::models::{ExtractedContent, IndexableObject, ObjectKind, Repository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexStatus {
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryFailure {
    pub repository: String,
    pub reason: String,
}

/// An object that was skipped or failed, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectReport {
    pub repository: String,
    pub object_id: String,
    pub kind: ObjectKind,
    pub source_path: String,
    pub reason: String,
}

/// Completion report of a reindex pass. Returned for partial passes too.
#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub status: ReindexStatus,
    pub repositories_processed: Vec<String>,
    pub repositories_failed: Vec<RepositoryFailure>,
    /// Repositories whose traversal was cut short by the deadline.
    pub repositories_incomplete: Vec<String>,
    pub objects_indexed: usize,
    pub objects_skipped: Vec<ObjectReport>,
    pub objects_failed: Vec<ObjectReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReindexReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: ReindexStatus::Completed,
            repositories_processed: Vec::new(),
            repositories_failed: Vec::new(),
            repositories_incomplete: Vec::new(),
            objects_indexed: 0,
            objects_skipped: Vec::new(),
            objects_failed: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    fn absorb(&mut self, outcome: RepositoryOutcome) {
        self.objects_indexed += outcome.indexed;
        self.objects_skipped.extend(outcome.skipped);
        self.objects_failed.extend(outcome.failed);
        match outcome.error {
            Some(reason) => self.repositories_failed.push(RepositoryFailure {
                repository: outcome.repository,
                reason,
            }),
            None => {
                if outcome.incomplete {
                    self.repositories_incomplete.push(outcome.repository.clone());
                }
                self.repositories_processed.push(outcome.repository);
            }
        }
    }

    /// Folds a finished repository task into the report. A panicked task is
    /// a failed repository; an access-service failure is handed back so the
    /// pass can be aborted.
    fn settle(
        &mut self,
        repository: String,
        joined: std::result::Result<Result<RepositoryOutcome>, JoinError>,
    ) -> Option<Error> {
        match joined {
            Ok(Ok(outcome)) => self.absorb(outcome),
            Ok(Err(e)) => return Some(e),
            Err(e) if e.is_panic() => {
                tracing::error!(%repository, "repository task panicked");
                self.repositories_failed.push(RepositoryFailure {
                    repository,
                    reason: "internal error".to_string(),
                });
            }
            Err(_) => {}
        }
        None
    }

    fn finish(mut self, timed_out: bool) -> Self {
        self.finished_at = Utc::now();
        self.status = if timed_out || !self.repositories_incomplete.is_empty() {
            ReindexStatus::TimedOut
        } else if self.repositories_processed.is_empty() && !self.repositories_failed.is_empty() {
            ReindexStatus::Failed
        } else {
            ReindexStatus::Completed
        };
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Deadline(Instant);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// What one repository pass produced.
#[derive(Debug, Default)]
struct RepositoryOutcome {
    repository: String,
    indexed: usize,
    skipped: Vec<ObjectReport>,
    failed: Vec<ObjectReport>,
    incomplete: bool,
    error: Option<String>,
}

#[derive(Clone)]
pub struct Reindexer {
    enumerator: Enumerator,
    resolver: PermissionResolver,
    indexer: Arc<Indexer>,
    limits: SizeLimits,
    timeout: Duration,
    workers: usize,
}

impl Reindexer {
    pub fn new(
        enumerator: Enumerator,
        resolver: PermissionResolver,
        indexer: Arc<Indexer>,
        limits: SizeLimits,
        timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            enumerator,
            resolver,
            indexer,
            limits,
            timeout,
            workers: workers.max(1),
        }
    }

    pub fn from_config(
        config: &Config,
        resolver: PermissionResolver,
        indexer: Arc<Indexer>,
    ) -> Self {
        let enumerator = Enumerator::new(&config.storage.repository_store, resolver.clone());
        Self::new(
            enumerator,
            resolver,
            indexer,
            config.size_limits(),
            config.reindex_timeout(),
            config.reindex.workers,
        )
    }

    /// Reindexes every repository under `subpath` the caller may read.
    ///
    /// Errors when the pass cannot start (a bad subpath, or no permitted set
    /// from the access-control service) and when that service goes away
    /// while repositories are being re-confirmed.
    pub async fn reindex(
        &self,
        token: &CallerToken,
        subpath: Option<&str>,
    ) -> Result<ReindexReport> {
        let started_at = Utc::now();
        let deadline = Deadline::after(self.timeout);
        tracing::info!(
            path = subpath.unwrap_or("/"),
            anonymous = token.is_anonymous(),
            "reindex started"
        );

        let walker = self.enumerator.enumerate(subpath, token).await?;
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        let mut report = ReindexReport::new(started_at);
        let mut timed_out = false;
        let mut aborted = None;

        for repository in walker {
            while let Some(joined) = tasks.try_join_next_with_id() {
                aborted = aborted.or(settle_joined(&mut report, &mut names, joined));
            }
            if aborted.is_some() {
                break;
            }
            if deadline.expired() {
                timed_out = true;
                break;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit,
                _ = tokio::time::sleep_until(deadline.0) => {
                    timed_out = true;
                    break;
                }
            };
            let Ok(permit) = permit else { break };
            if deadline.expired() {
                timed_out = true;
                break;
            }
            let pass = self.clone();
            let token = token.clone();
            let name = repository.full_name.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                pass.run_repository(&token, repository, deadline).await
            });
            names.insert(handle.id(), name);
        }
        if aborted.is_some() {
            tasks.abort_all();
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            if let Some(e) = settle_joined(&mut report, &mut names, joined) {
                tasks.abort_all();
                aborted = aborted.or(Some(e));
            }
        }
        if let Some(e) = aborted {
            tracing::error!(error = %e, "reindex aborted");
            return Err(e);
        }

        let report = report.finish(timed_out);
        log_report(&report);
        Ok(report)
    }

    /// Reindexes one repository by `owner/name`.
    pub async fn reindex_repository(
        &self,
        token: &CallerToken,
        full_name: &str,
    ) -> Result<ReindexReport> {
        let started_at = Utc::now();
        let deadline = Deadline::after(self.timeout);
        let full_name = full_name.trim().trim_end_matches(".git");
        let parts: Vec<&str> = full_name.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty() || *p == "." || *p == "..") {
            return Err(Error::MalformedRequest(format!(
                "repository must be given as owner/name: {}",
                full_name
            )));
        }
        let denied = || {
            Error::AuthorizationDenied(format!("{} is not an accessible repository", full_name))
        };

        // An owner directory that does not exist is reported like any other
        // repository the caller cannot see.
        let walker = match self.enumerator.enumerate(Some(parts[0]), token).await {
            Err(Error::MalformedRequest(_)) => return Err(denied()),
            walker => walker?,
        };
        let Some(repository) = walker
            .into_iter()
            .find(|r| r.full_name.eq_ignore_ascii_case(full_name))
        else {
            return Err(denied());
        };

        let name = repository.full_name.clone();
        let pass = self.clone();
        let caller = token.clone();
        let joined = tokio::spawn(async move {
            pass.run_repository(&caller, repository, deadline).await
        })
        .await;

        let mut report = ReindexReport::new(started_at);
        if let Some(e) = report.settle(name, joined) {
            tracing::error!(error = %e, "reindex aborted");
            return Err(e);
        }
        let report = report.finish(false);
        log_report(&report);
        Ok(report)
    }

    async fn run_repository(
        &self,
        token: &CallerToken,
        repository: Repository,
        deadline: Deadline,
    ) -> Result<RepositoryOutcome> {
        let mut outcome = RepositoryOutcome {
            repository: repository.full_name.clone(),
            ..Default::default()
        };
        match self.traverse(token, &repository, deadline, &mut outcome).await {
            Err(e @ Error::AuthorizationServiceUnavailable(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    repository = %repository.full_name,
                    error = %e,
                    "repository pass aborted"
                );
                outcome.error = Some(e.to_string());
            }
            Ok(()) => tracing::info!(
                repository = %repository.full_name,
                indexed = outcome.indexed,
                skipped = outcome.skipped.len(),
                failed = outcome.failed.len(),
                incomplete = outcome.incomplete,
                "repository indexed"
            ),
        }
        Ok(outcome)
    }

    async fn traverse(
        &self,
        token: &CallerToken,
        repository: &Repository,
        deadline: Deadline,
        outcome: &mut RepositoryOutcome,
    ) -> Result<()> {
        self.resolver.confirm(token, &repository.full_name).await?;
        let git = GitRepo::new(&repository.storage_path);

        for commit in git.commits().await? {
            if deadline.expired() {
                outcome.incomplete = true;
                return Ok(());
            }
            let object = IndexableObject {
                repository_id: repository.id.clone(),
                object_id: commit,
                kind: ObjectKind::Commit,
                source_path: String::new(),
                declared_size: None,
            };
            let content = self.read_commit(&git, &object).await;
            self.record(repository, &object, content, outcome).await;
        }

        let mut seen = HashSet::new();
        for head in git.branch_heads().await? {
            for blob in git.tree_blobs(&head).await? {
                if !seen.insert(blob.object_id.clone()) {
                    continue;
                }
                if deadline.expired() {
                    outcome.incomplete = true;
                    return Ok(());
                }
                let object = blob_object(repository, blob);
                let content = self.read_blob(&git, &object).await;
                self.record(repository, &object, content, outcome).await;
            }
        }
        Ok(())
    }

    async fn read_commit(
        &self,
        git: &GitRepo,
        object: &IndexableObject,
    ) -> Result<ExtractedContent> {
        let read = git
            .read_object("commit", &object.object_id, self.limits.text)
            .await;
        let bytes = read_or_skip(read)?;
        Ok(match bytes {
            Ok(bytes) => extract::extract(ContentClass::PlainText, &bytes, &self.limits),
            Err(skipped) => skipped,
        })
    }

    async fn read_blob(
        &self,
        git: &GitRepo,
        object: &IndexableObject,
    ) -> Result<ExtractedContent> {
        let oid = &object.object_id;
        let class = ContentClass::from_path(&object.source_path);

        if class == Some(ContentClass::FixedHeaderBinary) {
            let bytes = git.read_prefix("blob", oid, FIXED_HEADER_LEN as u64).await?;
            return Ok(extract::extract(
                ContentClass::FixedHeaderBinary,
                &bytes,
                &self.limits,
            ));
        }

        let limit = class.unwrap_or(ContentClass::PlainText).read_limit(&self.limits);
        if let Some(size) = object.declared_size.filter(|size| *size > limit) {
            return Ok(ExtractedContent::from_error(&ExtractError::SizeLimitExceeded {
                size,
                limit,
            }));
        }
        let bytes = match read_or_skip(git.read_object("blob", oid, limit).await)? {
            Ok(bytes) => bytes,
            Err(skipped) => return Ok(skipped),
        };
        let class = class.unwrap_or_else(|| ContentClass::sniff(&bytes));
        Ok(extract::extract(class, &bytes, &self.limits))
    }

    /// Folds one object's extraction into the outcome and submits the
    /// document unless extraction failed outright.
    async fn record(
        &self,
        repository: &Repository,
        object: &IndexableObject,
        content: Result<ExtractedContent>,
        outcome: &mut RepositoryOutcome,
    ) {
        let content = match content {
            Ok(content) => content,
            Err(e) => {
                outcome.failed.push(object_report(repository, object, e.to_string()));
                return;
            }
        };
        if let Some(reason) = content.reason().filter(|_| !content.is_skipped()) {
            tracing::warn!(
                repository = %repository.full_name,
                object = %object.object_id,
                path = %object.source_path,
                %reason,
                "extraction failed"
            );
            outcome.failed.push(object_report(repository, object, reason));
            return;
        }

        let document = build_document(object, &content);
        if let Err(e) = self.indexer.submit(&document).await {
            tracing::warn!(
                repository = %repository.full_name,
                object = %object.object_id,
                error = %e,
                "submission failed"
            );
            outcome.failed.push(object_report(repository, object, e.to_string()));
            return;
        }

        match content.reason() {
            Some(reason) => {
                tracing::debug!(
                    object = %object.object_id,
                    path = %object.source_path,
                    %reason,
                    "skipped"
                );
                outcome.skipped.push(object_report(repository, object, reason));
            }
            None => outcome.indexed += 1,
        }
    }
}

/// Splits a bounded read into bytes, a skip (extraction-level error), or a
/// hard error for the object.
fn read_or_skip(
    read: Result<Vec<u8>>,
) -> Result<std::result::Result<Vec<u8>, ExtractedContent>> {
    match read {
        Ok(bytes) => Ok(Ok(bytes)),
        Err(Error::Extract(e)) => Ok(Err(ExtractedContent::from_error(&e))),
        Err(e) => Err(e),
    }
}

fn blob_object(repository: &Repository, blob: TreeBlob) -> IndexableObject {
    IndexableObject {
        repository_id: repository.id.clone(),
        object_id: blob.object_id,
        kind: ObjectKind::Blob,
        source_path: blob.path,
        declared_size: blob.size,
    }
}

fn object_report(
    repository: &Repository,
    object: &IndexableObject,
    reason: String,
) -> ObjectReport {
    ObjectReport {
        repository: repository.full_name.clone(),
        object_id: object.object_id.clone(),
        kind: object.kind,
        source_path: object.source_path.clone(),
        reason,
    }
}

type Joined = std::result::Result<(tokio::task::Id, Result<RepositoryOutcome>), JoinError>;

/// Looks up the repository a finished task belonged to and settles it.
fn settle_joined(
    report: &mut ReindexReport,
    names: &mut HashMap<tokio::task::Id, String>,
    joined: Joined,
) -> Option<Error> {
    let (id, result) = match joined {
        Ok((id, outcome)) => (id, Ok(outcome)),
        Err(e) => (e.id(), Err(e)),
    };
    let repository = names.remove(&id).unwrap_or_default();
    report.settle(repository, result)
}

fn log_report(report: &ReindexReport) {
    tracing::info!(
        status = ?report.status,
        repositories = report.repositories_processed.len(),
        repositories_failed = report.repositories_failed.len(),
        indexed = report.objects_indexed,
        skipped = report.objects_skipped.len(),
        failed = report.objects_failed.len(),
        "reindex finished"
    );
}
