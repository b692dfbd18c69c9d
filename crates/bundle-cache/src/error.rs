use std::time::Duration;

use thiserror::Error;

/// An error returned from [`ResourceCache::with_resource`](crate::ResourceCache::with_resource)
/// on behalf of the cache itself.
///
/// The construction variants ([`NotFound`](Self::NotFound), [`Malformed`](Self::Malformed),
/// [`OpenFailed`](Self::OpenFailed) and [`InternalError`](Self::InternalError)) are recorded
/// once per cache entry and handed out verbatim to every caller borrowing that entry until it is
/// drained and removed. The remaining variants describe the caller's own wait and never affect
/// the entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource does not exist.
    #[error("not found")]
    NotFound,
    /// The resource exists, but is invalid in some way.
    ///
    /// For example, a bundle whose schema could not be migrated to the current version.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The resource could not be opened for another reason, like an I/O error.
    #[error("open failed: {0}")]
    OpenFailed(String),
    /// The caller's deadline passed before the resource was ready.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    /// The caller canceled its request before the resource was ready.
    #[error("request canceled")]
    Canceled,
    /// An unexpected error in the cache itself, for example a panicking opener.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::OpenFailed(err.to_string()),
        }
    }
}

impl CacheError {
    /// Whether this error describes the construction of a resource, as opposed to the
    /// caller's own wait.
    pub fn is_construction_error(&self) -> bool {
        !matches!(self, Self::DeadlineExceeded(_) | Self::Canceled)
    }

    /// A short tag used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Malformed(_) => "malformed",
            Self::OpenFailed(_) => "open-failed",
            Self::DeadlineExceeded(_) => "deadline",
            Self::Canceled => "canceled",
            Self::InternalError => "internal",
        }
    }
}

/// The outcome of opening a resource: either the resource or the reason it is unusable.
pub type OpenResult<T> = Result<T, CacheError>;
