//! Error taxonomy shared by the indexing and query pipelines.
//!
//! Extraction failures are kept in [`ExtractError`] (they are recorded per
//! object and never abort a pass); everything else is an [`Error`] whose
//! variant decides how far it propagates:
//!
//! | Variant | Scope |
//! |---------|-------|
//! | `AuthorizationServiceUnavailable` | aborts the whole request (fail closed) |
//! | `AuthorizationDenied`, `RepositoryUnreadable` | aborts one repository |
//! | `Extract`, `BackendUnavailable`, `BackendRejected` | recorded per object |
//! | `MalformedRequest`, `Timeout` | reported to the caller |

use std::time::Duration;

use thiserror::Error;

pub use crate::extract::ExtractError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("authorization service unavailable: {0}")]
    AuthorizationServiceUnavailable(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("search backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("search backend rejected request ({status}): {body}")]
    BackendRejected { status: u16, body: String },

    #[error("repository unreadable: {0}")]
    RepositoryUnreadable(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl Error {
    /// Machine-readable code used in HTTP error bodies and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AuthorizationDenied(_) => "authorization_denied",
            Error::AuthorizationServiceUnavailable(_) => "authorization_unavailable",
            Error::Extract(e) => e.code(),
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::BackendRejected { .. } => "backend_rejected",
            Error::RepositoryUnreadable(_) => "repository_unreadable",
            Error::Timeout(_) => "timeout",
            Error::MalformedRequest(_) => "bad_request",
        }
    }
}
