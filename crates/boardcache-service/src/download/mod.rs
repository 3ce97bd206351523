//! The transport layer below the in-memory caches.
//!
//! A [`Transport`] turns a [`CacheKey`] into the raw bytes of the resource. The coalescing
//! cache treats it as an opaque asynchronous function: it never retries, and it cancels a
//! fetch by dropping its future.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::{CacheEntry, CacheKey};

mod http;

pub use http::{DownloadTimeouts, HttpTransport, create_client};

/// Fetches the raw bytes of a resource.
pub trait Transport: Send + Sync + 'static {
    /// Fetches the resource identified by `key`.
    ///
    /// Implementations should report download progress through `progress` and must be
    /// cancel-safe: the returned future may be dropped at any await point.
    fn fetch<'a>(
        &'a self,
        key: &'a CacheKey,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, CacheEntry<Bytes>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn fetch<'a>(
        &'a self,
        key: &'a CacheKey,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, CacheEntry<Bytes>> {
        (**self).fetch(key, progress)
    }
}

/// The state of a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes received so far.
    pub downloaded: u64,
    /// The announced size of the body, if the server sent one.
    pub total: Option<u64>,
}

impl Progress {
    /// The downloaded fraction in `0.0..=1.0`, if the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Receives [`Progress`] updates from a [`Transport`].
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn Fn(Progress) + Send + Sync>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("active", &self.sink.is_some())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// A reporter that discards all updates.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn report(&self, progress: Progress) {
        if let Some(sink) = &self.sink {
            sink(progress);
        }
    }
}
