use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching or decoding a remote resource.
///
/// Errors are fanned out to every listener waiting on the same key, which is why this
/// type is [`Clone`]. None of them are ever cached: the next request for the same key
/// starts a fresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Decoding the resource would exceed the memory available to it.
    ///
    /// The in-memory cache releases memory before this error reaches any listener.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The requested location is not a fetchable URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// An unexpected error in boardcache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// Timeouts are reported as [`CacheError::DownloadError`] here, as reqwest does not tell which
/// of the timeouts fired. [`HttpTransport`](crate::download::HttpTransport) maps them to
/// [`CacheError::Timeout`] itself.
impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidUrl(err.to_string())
        } else {
            Self::DownloadError(err.to_string())
        }
    }
}

impl CacheError {
    /// Whether this is the "not found" sub-kind, which UIs render differently from
    /// generic failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// A short, stable name for this error kind, suitable as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::Malformed(_) => "malformed",
            Self::ResourceExhausted(_) => "exhausted",
            Self::InvalidUrl(_) => "invalidurl",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why a
/// resource could not be fetched or is otherwise unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_sub_kind() {
        assert!(CacheError::NotFound.is_not_found());
        assert!(!CacheError::DownloadError("503 Service Unavailable".into()).is_not_found());
        assert!(!CacheError::PermissionDenied("403 Forbidden".into()).is_not_found());
    }

    #[test]
    fn test_io_error_is_internal() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(CacheError::from(err), CacheError::InternalError);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CacheError::Malformed("unsupported image format".into()).to_string(),
            "malformed: unsupported image format"
        );
        assert_eq!(
            CacheError::Timeout(Duration::from_secs(5)).to_string(),
            "download timed out after 5s"
        );
    }
}
