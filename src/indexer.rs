//! Turns extracted objects into index documents and submits them.

use std::sync::Arc;

use serde_json::Value;

use crate::backend::SearchBackend;
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::identity;
use crate::models::{ExtractedContent, IndexDocument, IndexableObject, ObjectKind};

/// Backend index (partition) names per object kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNames {
    pub commits: String,
    pub blobs: String,
}

impl IndexNames {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            commits: config.commit_index.clone(),
            blobs: config.blob_index.clone(),
        }
    }

    pub fn for_kind(&self, kind: ObjectKind) -> &str {
        match kind {
            ObjectKind::Commit => &self.commits,
            ObjectKind::Blob => &self.blobs,
        }
    }

    pub fn all(&self) -> [&str; 2] {
        [self.blobs.as_str(), self.commits.as_str()]
    }
}

impl Default for IndexNames {
    fn default() -> Self {
        Self {
            commits: "commits".to_string(),
            blobs: "blobs".to_string(),
        }
    }
}

/// Builds the document for `object`. Skipped or failed extractions produce a
/// metadata-only document with empty text.
pub fn build_document(object: &IndexableObject, content: &ExtractedContent) -> IndexDocument {
    IndexDocument {
        identity: identity::resolve(&object.repository_id, &object.object_id),
        repository_id: object.repository_id.clone(),
        object_id: object.object_id.clone(),
        kind: object.kind,
        text: content.text.clone(),
        source_path: object.source_path.clone(),
    }
}

pub struct Indexer {
    backend: Arc<dyn SearchBackend>,
    indices: IndexNames,
}

impl Indexer {
    pub fn new(backend: Arc<dyn SearchBackend>, indices: IndexNames) -> Self {
        Self { backend, indices }
    }

    pub fn indices(&self) -> &IndexNames {
        &self.indices
    }

    /// Replace-if-exists write keyed by the document identity. Never retries.
    pub async fn submit(&self, document: &IndexDocument) -> Result<()> {
        let body: Value = serde_json::to_value(document)
            .map_err(|e| Error::MalformedRequest(format!("unserializable document: {}", e)))?;
        let index = self.indices.for_kind(document.kind);
        self.backend
            .put_document(index, &document.identity.to_hex(), &body)
            .await?;
        tracing::debug!(
            index,
            id = %document.identity,
            repository = %document.repository_id,
            path = %document.source_path,
            "document submitted"
        );
        Ok(())
    }
}
