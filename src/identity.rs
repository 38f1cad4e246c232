//! Content addresses for indexable objects.
//!
//! Every commit and blob is stored in the search backend under an
//! [`ObjectIdentity`]: the SHA-1 of the owning repository id and the raw
//! object id. The repository id namespaces the digest, so the same blob
//! pushed to two repositories produces two documents, and re-indexing an
//! unchanged object overwrites its previous document instead of adding one.

use std::fmt;

use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};

/// 160-bit index key for a `(repository, object)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity([u8; 20]);

impl ObjectIdentity {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, used as the backend document id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectIdentity({})", self.to_hex())
    }
}

impl Serialize for ObjectIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Derive the identity of `object_id` inside `repository_id`.
///
/// The two ids are separated by a NUL byte so that distinct pairs never
/// encode to the same input (`("1", "23")` vs `("12", "3")`).
pub fn resolve(repository_id: &str, object_id: &str) -> ObjectIdentity {
    let mut hasher = Sha1::new();
    hasher.update(repository_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(object_id.as_bytes());
    ObjectIdentity(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: &str = "3b18e512dba79e4c8300dd08aeb37f8e728b8dad";

    #[test]
    fn stable_across_calls() {
        let a = resolve("42", BLOB);
        let b = resolve("42", BLOB);
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 40);
    }

    #[test]
    fn namespaced_by_repository() {
        assert_ne!(resolve("1", BLOB), resolve("2", BLOB));
        assert_ne!(resolve("alice/data", BLOB), resolve("bob/data", BLOB));
    }

    #[test]
    fn separator_keeps_pairs_distinct() {
        assert_ne!(resolve("1", "23"), resolve("12", "3"));
    }

    #[test]
    fn known_digest() {
        // sha1("7\0abc")
        let mut hasher = Sha1::new();
        hasher.update(b"7\0abc");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(resolve("7", "abc").to_hex(), expected);
    }

    #[test]
    fn serializes_as_hex_string() {
        let id = resolve("7", "abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
    }
}
