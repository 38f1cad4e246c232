//! Read-only access to a repository's object store through the `git` CLI.
//!
//! All commands run with the repository as working directory, so both bare
//! (`name.git/`) and working-copy (`name/.git`) layouts work. Object reads
//! are bounded: a read never pulls more than `limit + 1` bytes from `git
//! cat-file` before giving up with a size error.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::extract::ExtractError;

/// A blob entry of a commit's tree (`git ls-tree -r -l`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlob {
    pub object_id: String,
    pub path: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every commit reachable from any ref, newest first.
    pub async fn commits(&self) -> Result<Vec<String>> {
        let out = self.run(&["rev-list", "--all"]).await?;
        Ok(lines(&out))
    }

    /// Commit ids the local branches point at.
    pub async fn branch_heads(&self) -> Result<Vec<String>> {
        let out = self
            .run(&["for-each-ref", "--format=%(objectname)", "refs/heads"])
            .await?;
        let mut heads = lines(&out);
        heads.sort();
        heads.dedup();
        Ok(heads)
    }

    /// All blobs in the tree of `commit`, with their paths and sizes.
    pub async fn tree_blobs(&self, commit: &str) -> Result<Vec<TreeBlob>> {
        let out = self.run(&["ls-tree", "-r", "-l", "-z", commit]).await?;
        Ok(parse_ls_tree(&out))
    }

    /// Reads an object's content, failing with `SizeLimitExceeded` as soon as
    /// more than `limit` bytes have arrived.
    pub async fn read_object(&self, kind: &str, object_id: &str, limit: u64) -> Result<Vec<u8>> {
        let data = self.read_prefix(kind, object_id, limit.saturating_add(1)).await?;
        if data.len() as u64 > limit {
            return Err(ExtractError::SizeLimitExceeded {
                size: data.len() as u64,
                limit,
            }
            .into());
        }
        Ok(data)
    }

    /// Reads at most `max` leading bytes of an object.
    pub async fn read_prefix(&self, kind: &str, object_id: &str, max: u64) -> Result<Vec<u8>> {
        let mut child = Command::new("git")
            .args(["cat-file", kind, object_id])
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unreadable(format!("failed to execute 'git cat-file': {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.unreadable("git cat-file produced no output pipe"))?;
        let mut data = Vec::new();
        stdout
            .take(max)
            .read_to_end(&mut data)
            .await
            .map_err(|e| self.unreadable(format!("reading {} {}: {}", kind, object_id, e)))?;

        if (data.len() as u64) < max {
            let status = child
                .wait()
                .await
                .map_err(|e| self.unreadable(e.to_string()))?;
            if !status.success() {
                return Err(self.unreadable(format!("git cat-file {} {} failed", kind, object_id)));
            }
        } else {
            let _ = child.kill().await;
        }
        Ok(data)
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.unreadable(format!("failed to execute 'git {}': {}", args[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unreadable(format!("git {} failed: {}", args[0], stderr.trim())));
        }
        Ok(output.stdout)
    }

    fn unreadable(&self, message: impl Into<String>) -> Error {
        Error::RepositoryUnreadable(format!("{}: {}", self.path.display(), message.into()))
    }
}

fn lines(out: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(out)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses NUL-terminated `<mode> <type> <oid> <size>\t<path>` records.
/// Submodule entries (type `commit`) are ignored.
fn parse_ls_tree(out: &[u8]) -> Vec<TreeBlob> {
    out.split(|b| *b == 0)
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (meta, path) = record.split_once('\t')?;
            let mut fields = meta.split_whitespace();
            let _mode = fields.next()?;
            if fields.next()? != "blob" {
                return None;
            }
            let object_id = fields.next()?.to_string();
            let size = fields.next().and_then(|s| s.parse::<u64>().ok());
            Some(TreeBlob {
                object_id,
                path: path.to_string(),
                size,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ls_tree_records() {
        let raw = b"100644 blob 3b18e512dba79e4c8300dd08aeb37f8e728b8dad      12\tREADME.md\0\
160000 commit 8ab686eafeb1f44702738c8b0f24f2567c36da6d       -\tvendor/lib\0\
100644 blob e69de29bb2d1d6434b8b29ae775ad8c2e48c5391       0\tdocs/with space.txt\0";
        let blobs = parse_ls_tree(raw);
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].path, "README.md");
        assert_eq!(blobs[0].size, Some(12));
        assert_eq!(blobs[1].path, "docs/with space.txt");
        assert_eq!(blobs[1].size, Some(0));
    }

    #[test]
    fn splits_lines() {
        assert_eq!(lines(b"a\n\nb\n"), vec!["a".to_string(), "b".to_string()]);
    }
}
