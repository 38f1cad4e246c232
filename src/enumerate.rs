//! Discovery of authorized repositories in the repository store.
//!
//! The store is laid out as `<root>/<owner>/<name>[.git]`. The walk is
//! depth-first and lazy: [`RepositoryWalker`] yields one [`Repository`] at a
//! time and stops descending at every repository root, so the internal
//! directories of a repository are never visited. Repositories the caller
//! is not permitted to read are skipped and the walk continues with the
//! next sibling.

use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::access::{CallerToken, PermissionResolver, PermittedRepositorySet};
use crate::error::{Error, Result};
use crate::models::Repository;

/// True for a bare repository (`HEAD`, `objects/`, `refs/`) or a working
/// copy with a `.git` entry.
pub fn is_repository_root(path: &Path) -> bool {
    path.join(".git").exists()
        || (path.join("HEAD").is_file()
            && path.join("objects").is_dir()
            && path.join("refs").is_dir())
}

/// `owner/name` for a repository directory, relative to the store root.
pub fn repository_name(store_root: &Path, repo_path: &Path) -> Option<String> {
    let relative = repo_path.strip_prefix(store_root).ok()?;
    let mut parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let last = parts.pop()?;
    let last = last.strip_suffix(".git").unwrap_or(&last).to_string();
    parts.push(last);
    Some(parts.join("/"))
}

/// Joins a caller-supplied subpath onto the store root. Absolute paths and
/// `..` components are refused.
pub fn resolve_subpath(store_root: &Path, subpath: Option<&str>) -> Result<PathBuf> {
    let Some(sub) = subpath.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(store_root.to_path_buf());
    };
    let sub_path = Path::new(sub);
    if sub_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::MalformedRequest(format!(
            "storage path must be relative to the store: {}",
            sub
        )));
    }
    Ok(store_root.join(sub_path))
}

#[derive(Clone)]
pub struct Enumerator {
    store_root: PathBuf,
    resolver: PermissionResolver,
}

impl Enumerator {
    pub fn new(store_root: impl Into<PathBuf>, resolver: PermissionResolver) -> Self {
        Self {
            store_root: store_root.into(),
            resolver,
        }
    }

    /// Resolves the caller's permitted set, then returns a lazy walk over the
    /// repositories under `subpath` that the caller may reindex.
    pub async fn enumerate(
        &self,
        subpath: Option<&str>,
        token: &CallerToken,
    ) -> Result<RepositoryWalker> {
        let start = resolve_subpath(&self.store_root, subpath)?;
        if !start.is_dir() {
            return Err(Error::MalformedRequest(format!(
                "storage path does not exist: {}",
                subpath.unwrap_or("")
            )));
        }
        let permitted = self.resolver.permitted_repositories(token).await?;
        Ok(RepositoryWalker::new(&self.store_root, &start, permitted))
    }
}

pub struct RepositoryWalker {
    store_root: PathBuf,
    walker: walkdir::IntoIter,
    permitted: PermittedRepositorySet,
}

impl RepositoryWalker {
    pub fn new(store_root: &Path, start: &Path, permitted: PermittedRepositorySet) -> Self {
        Self {
            store_root: store_root.to_path_buf(),
            walker: WalkDir::new(start).sort_by_file_name().into_iter(),
            permitted,
        }
    }

    fn authorize(&self, path: &Path) -> Option<Repository> {
        let full_name = repository_name(&self.store_root, path)?;
        let Some(remote) = self.permitted.lookup(&full_name) else {
            tracing::debug!(repository = %full_name, "not permitted for caller, skipping");
            return None;
        };
        Some(Repository {
            id: remote.id_string(),
            owner: full_name
                .split_once('/')
                .map(|(o, _)| o.to_string())
                .unwrap_or_default(),
            full_name,
            storage_path: path.to_path_buf(),
            visibility: remote.visibility(),
        })
    }
}

impl Iterator for RepositoryWalker {
    type Item = Repository;

    fn next(&mut self) -> Option<Repository> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable store entry");
                    continue;
                }
            };
            if !entry.file_type().is_dir() || !is_repository_root(entry.path()) {
                continue;
            }
            self.walker.skip_current_dir();
            if let Some(repo) = self.authorize(entry.path()) {
                return Some(repo);
            }
        }
    }
}
