#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use repo_index::access::{AccessControl, CallerToken, RemoteOwner, RemoteRepository};
use repo_index::backend::{MemoryBackend, SearchBackend};
use repo_index::config::Config;
use repo_index::error::{Error, Result};
use serde_json::Value;

pub fn remote(id: i64, full_name: &str, private: bool) -> RemoteRepository {
    let (owner, name) = full_name.split_once('/').unwrap();
    RemoteRepository {
        id,
        name: name.to_string(),
        full_name: full_name.to_string(),
        private,
        owner: RemoteOwner {
            username: owner.to_string(),
            login: owner.to_string(),
        },
    }
}

/// In-memory access-control service.
#[derive(Default)]
pub struct FakeAccess {
    pub users: HashMap<String, Vec<RemoteRepository>>,
    pub public: Vec<RemoteRepository>,
    /// Repositories listed above whose per-repository check now fails.
    pub revoked: HashSet<String>,
    pub offline: bool,
    /// Listings still answer but per-repository checks cannot reach the
    /// service.
    pub checks_offline: bool,
}

impl FakeAccess {
    pub fn with_user(mut self, token: &str, repos: Vec<RemoteRepository>) -> Self {
        self.users.insert(token.to_string(), repos);
        self
    }

    pub fn with_public(mut self, repos: Vec<RemoteRepository>) -> Self {
        self.public = repos;
        self
    }
}

#[async_trait]
impl AccessControl for FakeAccess {
    async fn user_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        if self.offline {
            return Err(Error::AuthorizationServiceUnavailable("offline".into()));
        }
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| Error::AuthorizationDenied("unknown token".into()))
    }

    async fn public_repositories(&self) -> Result<Vec<RemoteRepository>> {
        if self.offline {
            return Err(Error::AuthorizationServiceUnavailable("offline".into()));
        }
        Ok(self.public.clone())
    }

    async fn repository(&self, token: &CallerToken, full_name: &str) -> Result<RemoteRepository> {
        if self.offline || self.checks_offline {
            return Err(Error::AuthorizationServiceUnavailable("offline".into()));
        }
        if self.revoked.contains(full_name) {
            return Err(Error::AuthorizationDenied(format!("{} revoked", full_name)));
        }
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

/// Memory backend whose writes take `delay`.
pub struct SlowBackend {
    pub inner: Arc<MemoryBackend>,
    pub delay: Duration,
}

#[async_trait]
impl SearchBackend for SlowBackend {
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_document(index, id, body).await
    }

    async fn search(&self, indices: &[&str], query: &Value) -> Result<Value> {
        self.inner.search(indices, query).await
    }
}

/// Memory backend that panics when asked to store a document of
/// `repository_id`.
pub struct PanickingBackend {
    pub inner: Arc<MemoryBackend>,
    pub repository_id: String,
}

#[async_trait]
impl SearchBackend for PanickingBackend {
    async fn put_document(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        if body["repositoryID"] == self.repository_id.as_str() {
            panic!("backend exploded on {}", id);
        }
        self.inner.put_document(index, id, body).await
    }

    async fn search(&self, indices: &[&str], query: &Value) -> Result<Value> {
        self.inner.search(indices, query).await
    }
}

pub fn config(store: &Path, extra: &str) -> Config {
    config_with_access(store, "http://127.0.0.1:9", extra)
}

pub fn config_with_access(store: &Path, access_url: &str, extra: &str) -> Config {
    format!(
        r#"
[storage]
repository_store = "{}"

[backend]
url = "http://127.0.0.1:9"

[access]
url = "{}"

{}
"#,
        store.display(),
        access_url,
        extra
    )
    .parse()
    .unwrap()
}

// ============ git fixtures ============

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args([
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .expect("git must be installed");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Creates a working-copy repository at `<store>/<owner>/<name>`.
pub fn init_repo(store: &Path, full_name: &str) -> PathBuf {
    let path = store.join(full_name);
    fs::create_dir_all(&path).unwrap();
    git(&path, &["init", "-q"]);
    path
}

/// Writes `files` and commits them with `message`.
pub fn commit(repo: &Path, files: &[(&str, &[u8])], message: &str) -> String {
    for (name, contents) in files {
        let file = repo.join(name);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&file, contents).unwrap();
        git(repo, &["add", name]);
    }
    git(repo, &["commit", "-q", "--allow-empty", "-m", message]);
    git(repo, &["rev-parse", "HEAD"])
}

pub fn blob_id(repo: &Path, path: &str) -> String {
    git(repo, &["rev-parse", &format!("HEAD:{}", path)])
}

// ============ content fixtures ============

/// Single-stream-per-page PDF with one text line per page.
pub fn pdf(pages: &[&str]) -> Vec<u8> {
    let page_count = pages.len();
    let font_id = 3 + 2 * page_count;
    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            (0..page_count)
                .map(|i| format!("{} 0 R", 3 + i))
                .collect::<Vec<_>>()
                .join(" "),
            page_count
        ),
    ];
    for i in 0..page_count {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >>",
            3 + page_count + i,
            font_id
        ));
    }
    for text in pages {
        let stream = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}\nendstream",
            stream.len(),
            stream
        ));
    }
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (i, obj) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, obj).as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(
        format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes(),
    );
    for off in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    out
}

/// Fixed-header recording file with `comment` in the header comment field.
pub fn nev(comment: &str) -> Vec<u8> {
    let mut header = vec![0u8; 332];
    header[..8].copy_from_slice(b"NEURALEV");
    header[76..76 + comment.len()].copy_from_slice(comment.as_bytes());
    header.extend_from_slice(&[0xAA; 64]);
    header
}

pub fn hit_paths(res: &Value) -> Vec<String> {
    let mut paths: Vec<String> = res["hits"]["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["_source"]["sourcePath"].as_str().unwrap_or_default().to_string())
        .collect();
    paths.sort();
    paths
}
