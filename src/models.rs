//! Core data models used throughout repo-index.
//!
//! These types represent the repositories, objects, and index documents
//! that flow through the reindex pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::extract::ExtractError;
use crate::identity::ObjectIdentity;

/// Visibility of a repository as reported by the access-control service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// A repository discovered in the store and authorized for the caller.
#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    /// Identifier assigned by the access-control service.
    pub id: String,
    /// `owner/name`, derived from the storage layout.
    pub full_name: String,
    pub storage_path: PathBuf,
    pub visibility: Visibility,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Commit,
    Blob,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Commit => f.write_str("commit"),
            ObjectKind::Blob => f.write_str("blob"),
        }
    }
}

/// A commit or blob of a repository. Content is read lazily from the
/// object store by the reindex pass.
#[derive(Debug, Clone)]
pub struct IndexableObject {
    pub repository_id: String,
    pub object_id: String,
    pub kind: ObjectKind,
    /// Path of a blob within its tree; empty for commits.
    pub source_path: String,
    /// Size reported by the object store, when known without reading.
    pub declared_size: Option<u64>,
}

/// Outcome of running a content extractor over an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum ExtractionStatus {
    Ok,
    SkippedTooLarge,
    SkippedUnsupported,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub status: ExtractionStatus,
}

impl ExtractedContent {
    pub fn ok(text: String) -> Self {
        Self {
            text,
            status: ExtractionStatus::Ok,
        }
    }

    /// Maps an extraction error to a status. Size violations are skips,
    /// everything else is a failure carrying the error message.
    pub fn from_error(err: &ExtractError) -> Self {
        let status = match err {
            ExtractError::SizeLimitExceeded { .. } => ExtractionStatus::SkippedTooLarge,
            ExtractError::UnsupportedFormat(_) => ExtractionStatus::SkippedUnsupported,
            other => ExtractionStatus::Failed(other.to_string()),
        };
        Self {
            text: String::new(),
            status,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self.status,
            ExtractionStatus::SkippedTooLarge | ExtractionStatus::SkippedUnsupported
        )
    }

    /// Short human-readable reason for non-`Ok` statuses.
    pub fn reason(&self) -> Option<String> {
        match &self.status {
            ExtractionStatus::Ok => None,
            ExtractionStatus::SkippedTooLarge => Some("too large".to_string()),
            ExtractionStatus::SkippedUnsupported => Some("unsupported format".to_string()),
            ExtractionStatus::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// Document written to the search backend.
///
/// Serializes to the wire body `{repositoryID, objectID, sourcePath, text, kind}`;
/// the identity is the document key and travels in the URL.
#[derive(Debug, Clone, Serialize)]
pub struct IndexDocument {
    #[serde(skip)]
    pub identity: ObjectIdentity,
    #[serde(rename = "repositoryID")]
    pub repository_id: String,
    #[serde(rename = "objectID")]
    pub object_id: String,
    pub kind: ObjectKind,
    pub text: String,
    #[serde(rename = "sourcePath")]
    pub source_path: String,
}
